use std::sync::Arc;

use lobby_settings::SessionSettings;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::discovery::DiscoveryService;
use crate::handshake::HandshakeGateway;
use crate::host::{HostLimits, HostService};
use crate::lifecycle::{LifecyclePolicy, LifecycleStats, SessionLifecycleManager};
use crate::registry::SessionRegistry;

/// Engine configuration, derived from the `sessions` settings section.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub default_capacity: usize,
    pub max_capacity: usize,
    pub max_display_name_len: usize,
    pub event_queue: usize,
    pub policy: LifecyclePolicy,
}

impl From<&SessionSettings> for EngineConfig {
    fn from(s: &SessionSettings) -> Self {
        Self {
            default_capacity: s.default_capacity,
            max_capacity: s.max_capacity,
            max_display_name_len: s.max_display_name_len,
            event_queue: s.event_queue,
            policy: LifecyclePolicy::from(s),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

/// One registry plus the services wired to it.
///
/// `init` starts with an empty registry and spawns the lifecycle task;
/// `teardown` stops the task and drops the registry. Services receive the
/// registry explicitly, nothing is global.
pub struct LobbyEngine {
    registry: Arc<SessionRegistry>,
    host: Arc<HostService>,
    discovery: Arc<DiscoveryService>,
    gateway: Arc<HandshakeGateway>,
    stats: Arc<LifecycleStats>,
    cancel: CancellationToken,
    lifecycle: JoinHandle<()>,
}

impl LobbyEngine {
    /// Must be called from within a Tokio runtime.
    pub fn init(config: EngineConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.default_capacity));
        let (event_tx, event_rx) = mpsc::channel(config.event_queue.max(1));

        let host = Arc::new(HostService::new(
            Arc::clone(&registry),
            HostLimits {
                max_display_name_len: config.max_display_name_len,
                max_capacity: config.max_capacity,
            },
        ));
        let discovery = Arc::new(DiscoveryService::new(Arc::clone(&registry)));
        let gateway = Arc::new(HandshakeGateway::new(
            Arc::clone(&registry),
            event_tx,
            config.max_display_name_len,
        ));

        let manager = SessionLifecycleManager::new(Arc::clone(&registry), config.policy.clone());
        let stats = manager.stats();
        let cancel = CancellationToken::new();
        let lifecycle = manager.spawn(event_rx, cancel.clone());

        tracing::info!(
            default_capacity = config.default_capacity,
            host_timeout_ms = config.policy.host_timeout.as_millis() as u64,
            empty_grace_ms = config.policy.empty_grace.as_millis() as u64,
            "Lobby engine started"
        );

        Self {
            registry,
            host,
            discovery,
            gateway,
            stats,
            cancel,
            lifecycle,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn host(&self) -> Arc<HostService> {
        Arc::clone(&self.host)
    }

    pub fn discovery(&self) -> Arc<DiscoveryService> {
        Arc::clone(&self.discovery)
    }

    pub fn gateway(&self) -> Arc<HandshakeGateway> {
        Arc::clone(&self.gateway)
    }

    pub fn stats(&self) -> Arc<LifecycleStats> {
        Arc::clone(&self.stats)
    }

    /// Stop the lifecycle task and drop the registry. Sessions still open
    /// are discarded; they are ephemeral by nature.
    pub async fn teardown(self) {
        self.cancel.cancel();
        if let Err(e) = self.lifecycle.await {
            tracing::error!(error = %e, "Lifecycle task ended abnormally");
        }
        tracing::info!(dropped_sessions = self.registry.len(), "Lobby engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{Handshake, JoinRequest};
    use crate::host::HostRequest;
    use lobby_core::{ConnectionId, SessionState};
    use std::time::Duration;

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.policy = LifecyclePolicy {
            host_timeout: Duration::from_secs(60),
            empty_grace: Duration::from_secs(10),
            closed_retention: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        };
        config
    }

    #[tokio::test]
    async fn init_starts_empty() {
        let engine = LobbyEngine::init(EngineConfig::default());
        assert!(engine.registry().is_empty());
        assert!(engine.discovery().list().is_empty());
        engine.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn host_list_bind_leave_expire() {
        let engine = LobbyEngine::init(fast_config());

        let resp = engine.host().host(HostRequest::new("alice")).unwrap();
        let listed = engine.discovery().list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, resp.session_id);
        assert_eq!(listed[0].host_name, "alice");
        assert_eq!(listed[0].participant_count, 0);
        assert_eq!(listed[0].state, SessionState::Open);

        let mut hs = Handshake::new(ConnectionId::new());
        engine
            .gateway()
            .attempt(&mut hs, JoinRequest::new(resp.session_id.clone()));
        let participant = hs.participant().cloned().unwrap();
        let listed = engine.discovery().list();
        assert_eq!(listed[0].participant_count, 1);
        assert_eq!(listed[0].state, SessionState::Active);

        let _ = engine.gateway().release(&participant);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.discovery().list().len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(engine.discovery().list().is_empty());
        assert_eq!(engine.stats().counters().closed, 1);

        engine.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_session_disappears_after_host_timeout() {
        let engine = LobbyEngine::init(fast_config());
        let resp = engine.host().host(HostRequest::new("alice")).unwrap();

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert!(engine.discovery().list().is_empty());
        assert!(engine.registry().get(&resp.session_id).is_err());

        engine.teardown().await;
    }
}
