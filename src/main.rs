//! # lobby
//!
//! Session lobby server binary. Loads settings, installs logging, starts
//! the engine and the HTTP/WebSocket server, and runs until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use lobby_engine::{EngineConfig, LobbyEngine};
use lobby_server::ServerConfig;
use lobby_settings::LobbySettings;
use lobby_telemetry::TelemetryConfig;

/// Session lobby server.
#[derive(Parser, Debug)]
#[command(name = "lobby", about = "Session lobby and real-time handshake server")]
struct Cli {
    /// Settings file (defaults to `~/.lobby/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Default log level (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<LobbySettings> {
        let mut settings = match &self.config {
            Some(path) => lobby_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => lobby_settings::load_settings().context("Failed to load settings")?,
        };

        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    let telemetry = TelemetryConfig::from_settings(&settings.logging)?;
    lobby_telemetry::init_telemetry(&telemetry)?;

    let engine = LobbyEngine::init(EngineConfig::from(&settings.sessions));
    let handle = lobby_server::start(ServerConfig::from(&settings.server), engine)
        .await
        .with_context(|| {
            format!(
                "Failed to bind {}:{}",
                settings.server.host, settings.server.port
            )
        })?;

    tracing::info!(addr = %handle.addr, "Lobby server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    handle.shutdown().await;
    Ok(())
}
