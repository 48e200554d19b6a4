use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session limits and lifecycle timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Capacity of a session when the host does not ask for one.
    pub default_capacity: usize,
    /// Largest capacity a host may request.
    pub max_capacity: usize,
    /// Longest accepted display name, in characters.
    pub max_display_name_len: usize,
    /// An `Open` session nobody connected to is evicted after this long.
    pub host_timeout_ms: u64,
    /// An `Active` session left empty for this long is closed.
    pub empty_grace_ms: u64,
    /// A `Closed` session is kept (answering `SessionClosed`) for this long.
    pub closed_retention_ms: u64,
    /// Period of the lifecycle sweep.
    pub sweep_interval_ms: u64,
    /// Capacity of the gateway-to-lifecycle event channel.
    pub event_queue: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_capacity: 8,
            max_capacity: 64,
            max_display_name_len: 32,
            host_timeout_ms: 120_000,
            empty_grace_ms: 30_000,
            closed_retention_ms: 30_000,
            sweep_interval_ms: 5_000,
            event_queue: 1024,
        }
    }
}

impl SessionSettings {
    pub fn host_timeout(&self) -> Duration {
        Duration::from_millis(self.host_timeout_ms)
    }

    pub fn empty_grace(&self) -> Duration {
        Duration::from_millis(self.empty_grace_ms)
    }

    pub fn closed_retention(&self) -> Duration {
        Duration::from_millis(self.closed_retention_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
