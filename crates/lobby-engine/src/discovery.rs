use std::sync::Arc;

use lobby_core::SessionSummary;

use crate::registry::SessionRegistry;

/// Read-only listing of sessions that can still be joined or watched.
pub struct DiscoveryService {
    registry: Arc<SessionRegistry>,
}

impl DiscoveryService {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Oldest-first summaries of every non-closed session, read fresh from
    /// the registry on each call.
    pub fn list(&self) -> Vec<SessionSummary> {
        self.registry
            .list_open()
            .iter()
            .map(|s| s.summary())
            .collect()
    }
}
