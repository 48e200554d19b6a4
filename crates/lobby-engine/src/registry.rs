use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lobby_core::{LobbyError, Session, SessionId};

/// Authoritative in-memory store of sessions.
///
/// Every mutation of a given session runs while holding that session's map
/// entry exclusively, so two mutations on one id never interleave. Mutators
/// must not call back into the registry.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    next_seq: AtomicU64,
    default_capacity: usize,
}

impl SessionRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_seq: AtomicU64::new(0),
            default_capacity: default_capacity.max(1),
        }
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    /// Register a new `Open` session with the default capacity.
    pub fn create(&self, host_name: &str) -> Session {
        self.create_with_capacity(host_name, self.default_capacity)
    }

    pub fn create_with_capacity(&self, host_name: &str, capacity: usize) -> Session {
        loop {
            let id = SessionId::new();
            // v7 ids don't collide in practice; the vacant check keeps the
            // never-reused guarantee independent of that.
            if let Entry::Vacant(slot) = self.sessions.entry(id.clone()) {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let session = Session::new(id, host_name, capacity.max(1), seq);
                let _ = slot.insert(session.clone());
                tracing::debug!(session_id = %session.id, host = host_name, "Session registered");
                return session;
            }
        }
    }

    pub fn get(&self, id: &SessionId) -> Result<Session, LobbyError> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LobbyError::NotFound(id.clone()))
    }

    /// Snapshots of every session that is not `Closed`, oldest first.
    pub fn list_open(&self) -> Vec<Session> {
        let mut open: Vec<Session> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| entry.value().clone())
            .collect();
        sort_by_creation(&mut open);
        open
    }

    /// Snapshots of every session, closed ones included, oldest first.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sort_by_creation(&mut all);
        all
    }

    /// Apply `mutator` atomically and return the committed session.
    ///
    /// The mutator works on a copy; the copy replaces the stored session only
    /// when the mutator succeeds, so a rejected mutation changes nothing.
    pub fn update<F>(&self, id: &SessionId, mutator: F) -> Result<Session, LobbyError>
    where
        F: FnOnce(&mut Session) -> Result<(), LobbyError>,
    {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| LobbyError::NotFound(id.clone()))?;
        let mut draft = entry.value().clone();
        mutator(&mut draft)?;
        *entry.value_mut() = draft.clone();
        Ok(draft)
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Remove the session only if `predicate` holds for its current state.
    pub fn remove_if<P>(&self, id: &SessionId, predicate: P) -> bool
    where
        P: FnOnce(&Session) -> bool,
    {
        self.sessions.remove_if(id, |_, s| predicate(s)).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn sort_by_creation(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobby_core::{ConnectionId, Participant, SessionState};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn join(registry: &SessionRegistry, id: &SessionId, name: &str) -> Result<Session, LobbyError> {
        let participant = Participant::new(ConnectionId::new(), name, id.clone());
        registry.update(id, |s| s.join(participant))
    }

    #[test]
    fn create_assigns_unique_ids() {
        let registry = SessionRegistry::new(4);
        let ids: HashSet<SessionId> = (0..500).map(|_| registry.create("alice").id).collect();
        assert_eq!(ids.len(), 500);
        assert_eq!(registry.len(), 500);
    }

    #[test]
    fn created_session_is_open() {
        let registry = SessionRegistry::new(4);
        let s = registry.create("alice");
        assert_eq!(s.state(), SessionState::Open);
        assert_eq!(s.capacity, 4);
        assert_eq!(s.host_name, "alice");
        assert_eq!(s.participant_count(), 0);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let registry = SessionRegistry::new(0);
        assert_eq!(registry.create("alice").capacity, 1);
        assert_eq!(registry.create_with_capacity("bob", 0).capacity, 1);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let registry = SessionRegistry::new(4);
        let id = SessionId::from_raw("sess_missing");
        assert_eq!(registry.get(&id).unwrap_err(), LobbyError::NotFound(id));
    }

    #[test]
    fn list_open_is_oldest_first() {
        let registry = SessionRegistry::new(4);
        let a = registry.create("a");
        let b = registry.create("b");
        let c = registry.create("c");
        let listed: Vec<SessionId> = registry.list_open().into_iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn list_open_excludes_closed() {
        let registry = SessionRegistry::new(4);
        let a = registry.create("a");
        let b = registry.create("b");
        registry
            .update(&a.id, |s| {
                s.close(tokio::time::Instant::now());
                Ok(())
            })
            .unwrap();

        let listed = registry.list_open();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, b.id);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn list_open_returns_detached_snapshots() {
        let registry = SessionRegistry::new(4);
        let a = registry.create("a");
        let before = registry.list_open();
        join(&registry, &a.id, "bob").unwrap();
        assert_eq!(before[0].participant_count(), 0);
        assert_eq!(registry.list_open()[0].participant_count(), 1);
    }

    #[test]
    fn update_commits_on_success() {
        let registry = SessionRegistry::new(4);
        let a = registry.create("a");
        let updated = join(&registry, &a.id, "bob").unwrap();
        assert_eq!(updated.state(), SessionState::Active);
        assert_eq!(registry.get(&a.id).unwrap().participant_count(), 1);
    }

    #[test]
    fn failed_update_leaves_no_partial_state() {
        let registry = SessionRegistry::new(4);
        let a = registry.create("a");
        let err = registry
            .update(&a.id, |s| {
                s.join(Participant::new(ConnectionId::new(), "bob", s.id.clone()))?;
                Err(LobbyError::Internal("abort after join".into()))
            })
            .unwrap_err();
        assert!(matches!(err, LobbyError::Internal(_)));

        let stored = registry.get(&a.id).unwrap();
        assert_eq!(stored.participant_count(), 0);
        assert_eq!(stored.state(), SessionState::Open);
    }

    #[test]
    fn update_unknown_is_not_found() {
        let registry = SessionRegistry::new(4);
        let id = SessionId::from_raw("sess_missing");
        let result = registry.update(&id, |_| Ok(()));
        assert!(matches!(result, Err(LobbyError::NotFound(_))));
    }

    #[test]
    fn remove_reports_presence() {
        let registry = SessionRegistry::new(4);
        let a = registry.create("a");
        assert!(registry.remove(&a.id));
        assert!(!registry.remove(&a.id));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_if_checks_current_state() {
        let registry = SessionRegistry::new(4);
        let a = registry.create("a");
        assert!(!registry.remove_if(&a.id, |s| s.is_closed()));
        registry
            .update(&a.id, |s| {
                s.close(tokio::time::Instant::now());
                Ok(())
            })
            .unwrap();
        assert!(registry.remove_if(&a.id, |s| s.is_closed()));
        assert!(registry.get(&a.id).is_err());
    }

    #[test]
    fn concurrent_joins_respect_capacity() {
        let registry = Arc::new(SessionRegistry::new(1));
        let id = registry.create("host").id;

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                std::thread::spawn(move || join(&registry, &id, &format!("p{i}")).is_ok())
            })
            .collect();

        let bound = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(bound, 1);
        assert_eq!(registry.get(&id).unwrap().participant_count(), 1);
    }
}
