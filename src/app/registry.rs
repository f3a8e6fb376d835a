//! Multi-app host.
//!
//! Several apps in one process share a memory hub, register their
//! addons once, and get explicit lifecycle control. This is the
//! harness the scenario tests drive whole graphs with.

use crate::app::App;
use crate::config::AppConfig;
use crate::extension::ExtensionRegistry;
use crate::runloop::{LoopHandle, RunLoop};
use crate::transport::memory::{MemoryHub, MemoryTransport};
use crate::transport::Transport;
use anyhow::Result;
use std::sync::Arc;

pub struct AppRegistry {
    hub: Arc<MemoryHub>,
    extensions: Arc<ExtensionRegistry>,
    apps: Vec<(String, RunLoop<App>)>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
            extensions: ExtensionRegistry::new(),
            apps: Vec::new(),
        }
    }

    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.extensions
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport::new(self.hub.clone()))
    }

    pub fn spawn_app(&mut self, cfg: AppConfig) -> Result<LoopHandle<App>> {
        let uri = cfg.uri.clone();
        let rl = App::spawn(cfg, self.transport(), self.extensions.clone())?;
        let handle = rl.clone_handle();
        self.apps.push((uri, rl));
        Ok(handle)
    }

    pub fn handle(&self, uri: &str) -> Option<LoopHandle<App>> {
        self.apps
            .iter()
            .find(|(u, _)| u == uri)
            .map(|(_, rl)| rl.clone_handle())
    }

    /// Ask every app to close and wait for all of them.
    pub fn close_all(mut self) {
        for (_, rl) in &self.apps {
            rl.handle().post(|app| app.close_app());
        }
        for (_, rl) in self.apps.drain(..) {
            rl.join();
        }
    }

    /// Wait for the apps to finish on their own.
    pub fn wait(mut self) {
        for (_, rl) in self.apps.drain(..) {
            rl.join();
        }
    }
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::new()
    }
}
