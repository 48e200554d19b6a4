//! # lobby-settings
//!
//! Configuration for the lobby server, loaded from three layers (in priority
//! order):
//! 1. **Compiled defaults**: [`LobbySettings::default()`]
//! 2. **User file**: `~/.lobby/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `LOBBY_*` overrides (highest priority)
//!
//! Settings are returned by value and passed explicitly to whatever needs
//! them; there is no process-wide cache.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
