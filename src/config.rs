use crate::graph::GraphSpec;
use crate::utils::logger::LoggerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConnectRetryConfig {
    /// Total dial attempts before giving up.
    pub max_retries: Option<u32>,
    /// Pause between attempts, in milliseconds.
    pub interval_ms: Option<u64>,
}

impl ConnectRetryConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.unwrap_or(5).max(1)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.unwrap_or(500))
    }
}

/// A graph shipped with the app's config, startable by name.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PredefinedGraphDef {
    pub name: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub graph: GraphSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// This app's routable uri, e.g. `msgpack://10.0.0.1:8001/`.
    pub uri: String,
    /// Keep the app alive with zero engines; closing then requires an
    /// explicit close_app.
    pub long_running_mode: Option<bool>,
    /// Give each engine its own loop thread instead of sharing the
    /// app's.
    pub one_loop_per_engine: Option<bool>,
    pub handshake_timeout_ms: Option<u64>,
    pub retry: Option<ConnectRetryConfig>,
    pub predefined_graphs: Option<Vec<PredefinedGraphDef>>,
    pub logger: Option<LoggerConfig>,
}

impl AppConfig {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            long_running_mode: None,
            one_loop_per_engine: None,
            handshake_timeout_ms: None,
            retry: None,
            predefined_graphs: None,
            logger: None,
        }
    }

    pub fn long_running(&self) -> bool {
        self.long_running_mode.unwrap_or(false)
    }

    pub fn one_loop_per_engine(&self) -> bool {
        self.one_loop_per_engine.unwrap_or(false)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(
            self.handshake_timeout_ms
                .unwrap_or(crate::runloop::DEFAULT_HANDSHAKE_TIMEOUT_MS),
        )
    }

    pub fn retry(&self) -> ConnectRetryConfig {
        self.retry.clone().unwrap_or_default()
    }
}
