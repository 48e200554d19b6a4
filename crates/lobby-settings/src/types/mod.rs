//! Settings types. All structs deserialize with `#[serde(default)]`, so a
//! partial settings file only needs the keys it overrides.

mod server;
mod sessions;

pub use server::{LoggingSettings, ServerSettings};
pub use sessions::SessionSettings;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LobbySettings {
    pub server: ServerSettings,
    pub sessions: SessionSettings,
    pub logging: LoggingSettings,
}

impl LobbySettings {
    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.sessions;
        if s.default_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.defaultCapacity must be at least 1".into(),
            ));
        }
        if s.default_capacity > s.max_capacity {
            return Err(SettingsError::InvalidValue(format!(
                "sessions.defaultCapacity ({}) exceeds sessions.maxCapacity ({})",
                s.default_capacity, s.max_capacity
            )));
        }
        if s.max_display_name_len == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.maxDisplayNameLen must be at least 1".into(),
            ));
        }
        if s.sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.sweepIntervalMs must be positive".into(),
            ));
        }
        if self.server.heartbeat_interval_ms == 0 || self.server.cleanup_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs and server.cleanupIntervalMs must be positive".into(),
            ));
        }
        if self.server.client_timeout_ms <= self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "server.clientTimeoutMs ({}) must exceed server.heartbeatIntervalMs ({})",
                self.server.client_timeout_ms, self.server.heartbeat_interval_ms
            )));
        }
        if self.server.handshake_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.handshakeTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }
}
