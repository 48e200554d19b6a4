use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lobby_core::{ConnectionId, LobbyError, Session, SessionId, SessionState};
use lobby_settings::SessionSettings;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;

/// Messages from the gateway to the lifecycle manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Bound {
        session_id: SessionId,
        connection_id: ConnectionId,
    },
    Left {
        session_id: SessionId,
        connection_id: ConnectionId,
        remaining: usize,
    },
    /// The last participant of an active session disconnected at `at`.
    SessionEmptied { session_id: SessionId, at: Instant },
}

/// Timing rules for closing and evicting sessions.
#[derive(Clone, Debug)]
pub struct LifecyclePolicy {
    pub host_timeout: Duration,
    pub empty_grace: Duration,
    pub closed_retention: Duration,
    pub sweep_interval: Duration,
}

impl From<&SessionSettings> for LifecyclePolicy {
    fn from(s: &SessionSettings) -> Self {
        Self {
            host_timeout: s.host_timeout(),
            empty_grace: s.empty_grace(),
            closed_retention: s.closed_retention(),
            sweep_interval: s.sweep_interval(),
        }
    }
}

/// What the policy wants done to a session right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eviction {
    /// Open session nobody connected to: close and remove at once.
    Expire,
    /// Active session empty past the grace window.
    Close,
    /// Closed session past its retention window.
    Remove,
}

impl LifecyclePolicy {
    pub fn evaluate(&self, session: &Session, now: Instant) -> Option<Eviction> {
        let elapsed_since = |t: Instant| now.saturating_duration_since(t);
        match session.state() {
            SessionState::Open => (session.participant_count() == 0
                && elapsed_since(session.created_at) >= self.host_timeout)
                .then_some(Eviction::Expire),
            SessionState::Active => session
                .emptied_at()
                .filter(|_| session.participant_count() == 0)
                .filter(|t| elapsed_since(*t) >= self.empty_grace)
                .map(|_| Eviction::Close),
            SessionState::Closed => session
                .closed_at()
                .map_or(true, |t| elapsed_since(t) >= self.closed_retention)
                .then_some(Eviction::Remove),
        }
    }
}

/// Running totals, read by the health endpoint.
#[derive(Debug, Default)]
pub struct LifecycleStats {
    bound: AtomicU64,
    left: AtomicU64,
    closed: AtomicU64,
    removed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleCounters {
    pub bound: u64,
    pub left: u64,
    pub closed: u64,
    pub removed: u64,
}

impl LifecycleStats {
    pub fn counters(&self) -> LifecycleCounters {
        LifecycleCounters {
            bound: self.bound.load(Ordering::Relaxed),
            left: self.left.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
        }
    }
}

/// Sessions touched by one evaluation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub closed: Vec<SessionId>,
    pub removed: Vec<SessionId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.removed.is_empty()
    }

    fn merge(&mut self, other: SweepReport) {
        self.closed.extend(other.closed);
        self.removed.extend(other.removed);
    }
}

/// Owns time- and occupancy-based session transitions.
pub struct SessionLifecycleManager {
    registry: Arc<SessionRegistry>,
    policy: LifecyclePolicy,
    stats: Arc<LifecycleStats>,
}

impl SessionLifecycleManager {
    pub fn new(registry: Arc<SessionRegistry>, policy: LifecyclePolicy) -> Self {
        Self {
            registry,
            policy,
            stats: Arc::new(LifecycleStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<LifecycleStats> {
        Arc::clone(&self.stats)
    }

    /// Evaluate every session once.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        for session in self.registry.snapshot() {
            report.merge(self.evaluate(&session.id, now));
        }
        report
    }

    /// Evaluate one session. The decision is recomputed inside the atomic
    /// update, so a join that lands after a snapshot still prevents closure.
    pub fn evaluate(&self, id: &SessionId, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut decision = None;

        let result = self.registry.update(id, |s| {
            decision = self.policy.evaluate(s, now);
            if matches!(decision, Some(Eviction::Expire | Eviction::Close)) {
                let _ = s.close(now);
            }
            Ok(())
        });

        match result {
            Ok(_) => {}
            Err(LobbyError::NotFound(_)) => {
                debug!(session_id = %id, "Session vanished before evaluation");
                return report;
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Lifecycle evaluation failed, retrying next sweep");
                return report;
            }
        }

        match decision {
            Some(Eviction::Expire) => {
                let _ = self.stats.closed.fetch_add(1, Ordering::Relaxed);
                report.closed.push(id.clone());
                info!(session_id = %id, "Host never connected, session expired");
                self.remove_closed(id, &mut report);
            }
            Some(Eviction::Close) => {
                let _ = self.stats.closed.fetch_add(1, Ordering::Relaxed);
                report.closed.push(id.clone());
                info!(session_id = %id, "Session abandoned, closed after grace window");
            }
            Some(Eviction::Remove) => self.remove_closed(id, &mut report),
            None => {}
        }
        report
    }

    fn remove_closed(&self, id: &SessionId, report: &mut SweepReport) {
        if self.registry.remove_if(id, Session::is_closed) {
            let _ = self.stats.removed.fetch_add(1, Ordering::Relaxed);
            report.removed.push(id.clone());
            debug!(session_id = %id, "Session removed from registry");
        }
    }

    /// Record an event. Returns a deadline at which the session should be
    /// re-evaluated, if any.
    pub fn observe(&self, event: &LifecycleEvent) -> Option<(Instant, SessionId)> {
        match event {
            LifecycleEvent::Bound {
                session_id,
                connection_id,
            } => {
                let _ = self.stats.bound.fetch_add(1, Ordering::Relaxed);
                debug!(session_id = %session_id, connection_id = %connection_id, "Tracking participant");
                None
            }
            LifecycleEvent::Left {
                session_id,
                connection_id,
                remaining,
            } => {
                let _ = self.stats.left.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session_id = %session_id,
                    connection_id = %connection_id,
                    remaining,
                    "Participant left"
                );
                None
            }
            LifecycleEvent::SessionEmptied { session_id, at } => {
                debug!(session_id = %session_id, "Session empty, grace window started");
                Some((*at + self.policy.empty_grace, session_id.clone()))
            }
        }
    }

    /// Spawn the manager loop: periodic sweeps, event handling and
    /// per-session grace deadlines, until `cancel` fires.
    pub fn spawn(
        self,
        events: mpsc::Receiver<LifecycleEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(events, cancel))
    }

    pub async fn run(self, mut events: mpsc::Receiver<LifecycleEvent>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.policy.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadlines: BinaryHeap<Reverse<(Instant, SessionId)>> = BinaryHeap::new();
        let mut events_open = true;

        loop {
            let next_deadline = deadlines.peek().map(|Reverse((at, _))| *at);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep(Instant::now());
                    if !report.is_empty() {
                        info!(
                            closed = report.closed.len(),
                            removed = report.removed.len(),
                            remaining = self.registry.len(),
                            "Lifecycle sweep"
                        );
                    }
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        if let Some(deadline) = self.observe(&event) {
                            deadlines.push(Reverse(deadline));
                        }
                    }
                    None => {
                        debug!("Lifecycle event channel closed");
                        events_open = false;
                    }
                },
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    let now = Instant::now();
                    while deadlines.peek().is_some_and(|Reverse((at, _))| *at <= now) {
                        if let Some(Reverse((_, id))) = deadlines.pop() {
                            let _ = self.evaluate(&id, now);
                        }
                    }
                }
            }
        }
        info!(sessions = self.registry.len(), "Lifecycle manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobby_core::Participant;

    const HOST_TIMEOUT: Duration = Duration::from_secs(60);
    const GRACE: Duration = Duration::from_secs(10);
    const RETENTION: Duration = Duration::from_secs(5);

    fn policy() -> LifecyclePolicy {
        LifecyclePolicy {
            host_timeout: HOST_TIMEOUT,
            empty_grace: GRACE,
            closed_retention: RETENTION,
            sweep_interval: Duration::from_secs(1),
        }
    }

    fn setup() -> (SessionLifecycleManager, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new(4));
        (SessionLifecycleManager::new(Arc::clone(&registry), policy()), registry)
    }

    fn bind(registry: &SessionRegistry, id: &SessionId) -> Participant {
        let p = Participant::new(ConnectionId::new(), "p", id.clone());
        registry.update(id, |s| s.join(p.clone())).unwrap();
        p
    }

    fn unbind(registry: &SessionRegistry, p: &Participant, now: Instant) {
        registry
            .update(&p.session_id, |s| {
                let _ = s.leave(&p.connection_id, now);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn open_session_expires_after_host_timeout() {
        let (mgr, registry) = setup();
        let s = registry.create("alice");

        tokio::time::advance(HOST_TIMEOUT - Duration::from_millis(1)).await;
        assert!(mgr.sweep(Instant::now()).is_empty());
        assert_eq!(registry.list_open().len(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        let report = mgr.sweep(Instant::now());
        assert_eq!(report.closed, vec![s.id.clone()]);
        assert_eq!(report.removed, vec![s.id.clone()]);
        assert!(registry.get(&s.id).is_err());
        assert!(registry.list_open().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn active_session_survives_host_timeout() {
        let (mgr, registry) = setup();
        let s = registry.create("alice");
        let _p = bind(&registry, &s.id);

        tokio::time::advance(HOST_TIMEOUT * 2).await;
        assert!(mgr.sweep(Instant::now()).is_empty());
        assert_eq!(registry.get(&s.id).unwrap().state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_session_closes_only_after_grace() {
        let (mgr, registry) = setup();
        let s = registry.create("alice");
        let p = bind(&registry, &s.id);
        unbind(&registry, &p, Instant::now());

        assert!(mgr.sweep(Instant::now()).is_empty());
        tokio::time::advance(GRACE - Duration::from_millis(1)).await;
        assert!(mgr.sweep(Instant::now()).is_empty());
        assert_eq!(registry.get(&s.id).unwrap().state(), SessionState::Active);

        tokio::time::advance(Duration::from_millis(1)).await;
        let report = mgr.sweep(Instant::now());
        assert_eq!(report.closed, vec![s.id.clone()]);
        assert!(report.removed.is_empty());
        assert_eq!(registry.get(&s.id).unwrap().state(), SessionState::Closed);
        assert!(registry.list_open().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_session_removed_after_retention() {
        let (mgr, registry) = setup();
        let s = registry.create("alice");
        let p = bind(&registry, &s.id);
        unbind(&registry, &p, Instant::now());
        tokio::time::advance(GRACE).await;
        let _ = mgr.sweep(Instant::now());

        tokio::time::advance(RETENTION - Duration::from_millis(1)).await;
        assert!(mgr.sweep(Instant::now()).removed.is_empty());
        assert!(registry.get(&s.id).is_ok());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(mgr.sweep(Instant::now()).removed, vec![s.id.clone()]);
        assert!(registry.get(&s.id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_during_grace_cancels_closure() {
        let (mgr, registry) = setup();
        let s = registry.create("alice");
        let p = bind(&registry, &s.id);
        unbind(&registry, &p, Instant::now());

        tokio::time::advance(GRACE / 2).await;
        let _again = bind(&registry, &s.id);
        tokio::time::advance(GRACE).await;
        assert!(mgr.sweep(Instant::now()).is_empty());
        assert_eq!(registry.get(&s.id).unwrap().state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn closure_is_monotonic() {
        let (mgr, registry) = setup();
        let s = registry.create("alice");
        let p = bind(&registry, &s.id);
        unbind(&registry, &p, Instant::now());
        tokio::time::advance(GRACE).await;
        let _ = mgr.sweep(Instant::now());

        let late = Participant::new(ConnectionId::new(), "late", s.id.clone());
        let err = registry.update(&s.id, |s| s.join(late)).unwrap_err();
        assert!(matches!(err, LobbyError::SessionClosed(_)));
        assert_eq!(registry.get(&s.id).unwrap().state(), SessionState::Closed);
    }

    #[test]
    fn evaluate_missing_session_is_quiet() {
        let (mgr, _registry) = setup();
        let report = mgr.evaluate(&SessionId::from_raw("sess_gone"), Instant::now());
        assert!(report.is_empty());
    }

    #[test]
    fn observe_counts_and_schedules() {
        let (mgr, _registry) = setup();
        let sid = SessionId::from_raw("sess_1");
        let cid = ConnectionId::from_raw("conn_1");
        let at = Instant::now();

        assert!(mgr
            .observe(&LifecycleEvent::Bound {
                session_id: sid.clone(),
                connection_id: cid.clone(),
            })
            .is_none());
        assert!(mgr
            .observe(&LifecycleEvent::Left {
                session_id: sid.clone(),
                connection_id: cid,
                remaining: 0,
            })
            .is_none());
        let deadline = mgr.observe(&LifecycleEvent::SessionEmptied {
            session_id: sid.clone(),
            at,
        });
        assert_eq!(deadline, Some((at + GRACE, sid)));

        let counters = mgr.stats().counters();
        assert_eq!(counters.bound, 1);
        assert_eq!(counters.left, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn emptied_event_closes_at_deadline_without_sweep() {
        let registry = Arc::new(SessionRegistry::new(4));
        let mut slow_sweep = policy();
        slow_sweep.sweep_interval = Duration::from_secs(3600);
        let mgr = SessionLifecycleManager::new(Arc::clone(&registry), slow_sweep);
        let stats = mgr.stats();

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = mgr.spawn(rx, cancel.clone());
        // let the first (immediate) sweep run
        tokio::task::yield_now().await;

        let s = registry.create("alice");
        let p = bind(&registry, &s.id);
        let emptied = Instant::now();
        unbind(&registry, &p, emptied);
        tx.send(LifecycleEvent::SessionEmptied {
            session_id: s.id.clone(),
            at: emptied,
        })
        .await
        .unwrap();

        tokio::time::sleep(GRACE + Duration::from_millis(10)).await;
        assert_eq!(registry.get(&s.id).unwrap().state(), SessionState::Closed);
        assert_eq!(stats.counters().closed, 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
