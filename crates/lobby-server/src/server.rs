use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use lobby_engine::{DiscoveryService, HandshakeGateway, HostService, LifecycleStats, LobbyEngine, SessionRegistry};
use lobby_settings::ServerSettings;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::connection::{self, ConnectionRegistry};
use crate::handlers::{health_handler, host_handler, sessions_handler};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::ws_handler;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_send_queue: s.max_send_queue,
            handshake_timeout: s.handshake_timeout(),
            heartbeat_interval: s.heartbeat_interval(),
            client_timeout: s.client_timeout(),
            cleanup_interval: s.cleanup_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub host: Arc<HostService>,
    pub discovery: Arc<DiscoveryService>,
    pub gateway: Arc<HandshakeGateway>,
    pub registry: Arc<SessionRegistry>,
    pub stats: Arc<LifecycleStats>,
    pub connections: Arc<ConnectionRegistry>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(engine: &LobbyEngine, config: ServerConfig) -> Self {
        let connections = Arc::new(ConnectionRegistry::new(
            config.max_send_queue,
            config.client_timeout,
        ));
        Self {
            host: engine.host(),
            discovery: engine.discovery(),
            gateway: engine.gateway(),
            registry: engine.registry(),
            stats: engine.stats(),
            connections,
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/host", post(host_handler))
        .route("/sessions", get(sessions_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. The engine is owned by the
/// returned handle and torn down with it.
pub async fn start(config: ServerConfig, engine: LobbyEngine) -> Result<ServerHandle, std::io::Error> {
    let bound = bind(&config).await;
    let (listener, addr) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            engine.teardown().await;
            return Err(e);
        }
    };

    let state = AppState::new(&engine, config);
    let shutdown = ShutdownCoordinator::new();

    // Start dead-connection cleanup task
    let cleanup = connection::start_cleanup_task(
        Arc::clone(&state.connections),
        state.config.cleanup_interval,
        shutdown.token(),
    );

    let router = build_router(state.clone());
    let token = shutdown.token();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Server terminated with error");
        }
    });

    tracing::info!(%addr, "Lobby server started");

    Ok(ServerHandle {
        addr,
        state,
        shutdown,
        tasks: vec![server, cleanup],
        engine,
    })
}

async fn bind(config: &ServerConfig) -> Result<(tokio::net::TcpListener, SocketAddr), std::io::Error> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

/// Handle returned by `start()`. Keeps background tasks alive until
/// `shutdown` is called.
pub struct ServerHandle {
    pub addr: SocketAddr,
    state: AppState,
    shutdown: ShutdownCoordinator,
    tasks: Vec<JoinHandle<()>>,
    engine: LobbyEngine,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting, close every bound connection, wait for the server
    /// tasks and tear the engine down.
    pub async fn shutdown(self) {
        tracing::info!("Lobby server shutting down");
        let closed = self.state.connections.close_all();
        if closed > 0 {
            tracing::info!(closed, "Closing bound connections");
        }
        self.shutdown.graceful_shutdown(self.tasks, None).await;
        self.engine.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobby_engine::EngineConfig;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn config_from_settings() {
        let settings = ServerSettings {
            port: 7000,
            handshake_timeout_ms: 250,
            ..Default::default()
        };
        let config = ServerConfig::from(&settings);
        assert_eq!(config.port, 7000);
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
        assert_eq!(config.host, "127.0.0.1");
    }

    #[tokio::test]
    async fn build_router_creates_routes() {
        let engine = LobbyEngine::init(EngineConfig::default());
        let state = AppState::new(&engine, test_config());
        let _router = build_router(state);
        engine.teardown().await;
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let engine = LobbyEngine::init(EngineConfig::default());
        let handle = start(test_config(), engine).await.unwrap();
        assert!(handle.port() > 0);

        let url = format!("http://{}/health", handle.addr);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["connections"], 0);
        assert_eq!(body["lifecycle"]["bound"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = start(test_config(), LobbyEngine::init(EngineConfig::default()))
            .await
            .unwrap();
        let taken = ServerConfig {
            port: first.port(),
            ..Default::default()
        };
        let second = start(taken, LobbyEngine::init(EngineConfig::default())).await;
        assert!(second.is_err());
        first.shutdown().await;
    }
}
