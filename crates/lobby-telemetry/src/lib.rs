use lobby_settings::LoggingSettings;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "lobby_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout instead of the human-readable format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("unknown log level {value:?} for {target}")]
    InvalidLevel { target: String, value: String },
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

impl TelemetryConfig {
    /// Build from the `logging` section of the settings file.
    pub fn from_settings(settings: &LoggingSettings) -> Result<Self, TelemetryError> {
        let log_level = parse_level("default", &settings.level)?;
        let module_levels = settings
            .modules
            .iter()
            .map(|(module, level)| Ok((module.clone(), parse_level(module, level)?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;
        Ok(Self {
            log_level,
            module_levels,
            json: settings.json,
        })
    }

    /// Filter directive string, e.g. `info,lobby_engine=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

fn parse_level(target: &str, value: &str) -> Result<Level, TelemetryError> {
    value.parse().map_err(|_| TelemetryError::InvalidLevel {
        target: target.to_string(),
        value: value.to_string(),
    })
}

/// Initialize the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))
}
