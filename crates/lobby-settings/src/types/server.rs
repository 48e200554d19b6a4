use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
    /// How long a connection may stay `Pending` before it is rejected.
    pub handshake_timeout_ms: u64,
    /// Interval between server pings on bound connections.
    pub heartbeat_interval_ms: u64,
    /// A bound connection with no pong for this long is considered dead.
    pub client_timeout_ms: u64,
    /// How often dead connections are swept.
    pub cleanup_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6969,
            max_send_queue: 256,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            client_timeout_ms: 90_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

impl ServerSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Log output settings. `RUST_LOG`, when set, takes precedence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Per-target overrides, e.g. `{"lobby_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
            json: false,
        }
    }
}
