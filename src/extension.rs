//! Extension system boundary.
//!
//! Extensions are user code hosted in named groups; each group is a
//! worker thread fed through an SPSC ring. Extensions never touch
//! engine state: anything they want routed goes through the engine's
//! extension message queue plus a wakeup task, so only the engine
//! thread ever sees the remotes table.

use crate::error::GraphError;
use crate::graph::GraphSpec;
use crate::io::base::{BaseRx, BaseTx};
use crate::io::ringbuffer::{RingBuffer, RingSender};
use crate::io::swap::SwapQueue;
use crate::msg::{Loc, Msg, StatusCode};
use crate::utils::CancelToken;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

const GROUP_QUEUE_DEPTH: usize = 1024;
const GROUP_RECV_TICK: Duration = Duration::from_millis(100);

/// User-provided message handler living inside an extension group.
pub trait Extension: Send {
    fn on_start(&mut self, _env: &ExtensionEnv) {}
    fn on_msg(&mut self, msg: Msg, env: &ExtensionEnv);
    fn on_stop(&mut self) {}
}

/// The extension's view of the runtime: its own address and a way to
/// hand messages to the engine for routing.
#[derive(Clone)]
pub struct ExtensionEnv {
    pub loc: Loc,
    queue: SwapQueue<Msg>,
    wakeup: crate::engine::EngineHandle,
}

impl ExtensionEnv {
    /// Thread-safe enqueue plus a wakeup task on the engine loop.
    pub fn send_msg(&self, mut msg: Msg) {
        msg.src = self.loc.clone();
        self.queue.push(msg);
        self.wakeup.post(|engine| engine.process_extension_msgs());
    }

    /// Answer a command routed to this extension.
    pub fn send_result(&self, status: StatusCode, orig: &Msg, detail: &str) {
        let mut res = Msg::result_from(status, orig);
        res.set_detail(detail);
        self.send_msg(res);
    }
}

pub type ExtensionFactory = Box<dyn Fn() -> Box<dyn Extension> + Send + Sync>;

/// Addon-name to factory map. Registration replaces dynamic addon
/// loading: hosts register factories before spawning apps.
#[derive(Default)]
pub struct ExtensionRegistry {
    factories: Mutex<AHashMap<String, ExtensionFactory>>,
}

impl ExtensionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addon: &str, factory: ExtensionFactory) {
        self.factories.lock().insert(addon.to_string(), factory);
    }

    pub fn create(&self, addon: &str) -> Option<Box<dyn Extension>> {
        self.factories.lock().get(addon).map(|f| f())
    }
}

struct GroupHandle {
    tx: RingSender<Msg>,
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

/// The running extension system of one engine.
pub struct ExtensionContext {
    groups: AHashMap<String, GroupHandle>,
}

impl ExtensionContext {
    /// Instantiate every extension the graph places on this app and
    /// start one worker thread per group.
    pub fn start(
        graph: &GraphSpec,
        self_uri: &str,
        graph_id: &str,
        registry: &ExtensionRegistry,
        queue: SwapQueue<Msg>,
        wakeup: crate::engine::EngineHandle,
        parent_cancel: &CancelToken,
    ) -> Result<Self, GraphError> {
        let mut per_group: AHashMap<String, Vec<(String, Box<dyn Extension>, ExtensionEnv)>> =
            AHashMap::new();

        for node in graph.local_extensions(self_uri) {
            let ext = registry
                .create(&node.addon)
                .ok_or_else(|| GraphError::AddonNotFound(node.addon.clone()))?;
            let env = ExtensionEnv {
                loc: Loc::extension(self_uri, graph_id, &node.extension_group, &node.name),
                queue: queue.clone(),
                wakeup: wakeup.clone(),
            };
            per_group
                .entry(node.extension_group.clone())
                .or_default()
                .push((node.name.clone(), ext, env));
        }

        let mut groups = AHashMap::new();
        for (group_name, members) in per_group {
            let cancel = parent_cancel.new_child();
            let (tx, rx) = RingBuffer::bounded::<Msg>(GROUP_QUEUE_DEPTH);
            let thread_cancel = cancel.clone();
            let thread_name = format!("ext-group-{group_name}");
            let label = group_name.clone();

            let join = thread::Builder::new()
                .name(thread_name)
                .spawn(move || run_group(label, members, rx, thread_cancel))
                .map_err(|e| GraphError::MalformedSpec(format!("cannot spawn group: {e}")))?;

            groups.insert(
                group_name,
                GroupHandle {
                    tx,
                    cancel,
                    join: Some(join),
                },
            );
        }

        Ok(Self { groups })
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Hand a locally-addressed message to its group's thread. Errors
    /// if the destination group does not exist in this graph.
    pub fn deliver(&mut self, msg: Msg) -> Result<(), Msg> {
        let group_name = msg
            .dests
            .first()
            .map(|d| d.extension_group.clone())
            .unwrap_or_default();
        match self.groups.get_mut(&group_name) {
            Some(group) => {
                let cancel = group.cancel.clone();
                match group.tx.send(msg, &cancel, Some(Duration::from_secs(1))) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!("[ExtensionContext] group '{group_name}' rejected msg: {e}");
                        Err(e.value.unwrap_or_else(|| Msg::cmd("dropped")))
                    }
                }
            }
            None => Err(msg),
        }
    }

    /// Stop every group thread and wait for it.
    pub fn close(&mut self) {
        for (name, group) in self.groups.iter_mut() {
            debug!("[ExtensionContext] stopping group '{name}'");
            group.cancel.cancel();
        }
        for group in self.groups.values_mut() {
            if let Some(join) = group.join.take() {
                let _ = join.join();
            }
        }
        self.groups.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn run_group(
    name: String,
    mut members: Vec<(String, Box<dyn Extension>, ExtensionEnv)>,
    mut rx: crate::io::ringbuffer::RingReceiver<Msg>,
    cancel: CancelToken,
) {
    for (_, ext, env) in members.iter_mut() {
        ext.on_start(env);
    }

    loop {
        match rx.recv(&cancel, Some(GROUP_RECV_TICK)) {
            Ok(msg) => {
                let target = msg
                    .dests
                    .first()
                    .map(|d| d.extension.clone())
                    .unwrap_or_default();
                match members.iter_mut().find(|(n, _, _)| *n == target) {
                    Some((_, ext, env)) => ext.on_msg(msg, env),
                    None => {
                        warn!(
                            "[ExtensionGroup {name}] no extension '{target}' for msg '{}'",
                            msg.name
                        );
                    }
                }
            }
            Err(crate::error::RecvError::Timeout) => continue,
            Err(_) => break,
        }
    }

    for (_, ext, _) in members.iter_mut() {
        ext.on_stop();
    }
}
