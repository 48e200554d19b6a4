//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::LobbySettings;

const MAX_DURATION_MS: u64 = 86_400_000;

/// Resolve the path to the settings file (`~/.lobby/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".lobby").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LobbySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// [`LobbySettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LobbySettings> {
    let defaults = serde_json::to_value(LobbySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LobbySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `LOBBY_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut LobbySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Invalid values are ignored with
/// a warning so a typo never prevents startup.
pub fn apply_overrides(settings: &mut LobbySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("LOBBY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("LOBBY_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.u64("LOBBY_HANDSHAKE_TIMEOUT_MS", 1, MAX_DURATION_MS) {
        settings.server.handshake_timeout_ms = v;
    }

    // ── Sessions ────────────────────────────────────────────────────
    if let Some(v) = env.usize("LOBBY_DEFAULT_CAPACITY", 1, 10_000) {
        settings.sessions.default_capacity = v;
    }
    if let Some(v) = env.usize("LOBBY_MAX_CAPACITY", 1, 10_000) {
        settings.sessions.max_capacity = v;
    }
    if let Some(v) = env.u64("LOBBY_HOST_TIMEOUT_MS", 1, MAX_DURATION_MS) {
        settings.sessions.host_timeout_ms = v;
    }
    if let Some(v) = env.u64("LOBBY_EMPTY_GRACE_MS", 0, MAX_DURATION_MS) {
        settings.sessions.empty_grace_ms = v;
    }
    if let Some(v) = env.u64("LOBBY_CLOSED_RETENTION_MS", 0, MAX_DURATION_MS) {
        settings.sessions.closed_retention_ms = v;
    }
    if let Some(v) = env.u64("LOBBY_SWEEP_INTERVAL_MS", 1, MAX_DURATION_MS) {
        settings.sessions.sweep_interval_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("LOBBY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("LOBBY_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}
