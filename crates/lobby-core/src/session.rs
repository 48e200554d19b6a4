use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::errors::LobbyError;
use crate::ids::{ConnectionId, SessionId};

/// Lifecycle state of a session. Transitions only move forward:
/// `Open -> Active -> Closed` or `Open -> Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Hosted, nobody has connected yet.
    Open,
    /// At least one participant has bound.
    Active,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Active => "Active",
            Self::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One real-time connection bound to a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub display_name: String,
    /// Lookup key only; the session owns its participant set.
    pub session_id: SessionId,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(
        connection_id: ConnectionId,
        display_name: impl Into<String>,
        session_id: SessionId,
    ) -> Self {
        Self {
            connection_id,
            display_name: display_name.into(),
            session_id,
            joined_at: Utc::now(),
        }
    }
}

/// A hostable lobby. Instances handed out by the registry are snapshots;
/// changes only take effect through a registry update.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub host_name: String,
    pub capacity: usize,
    /// Registry-wide creation sequence, breaks ties between equal instants.
    pub seq: u64,
    pub created_at: Instant,
    pub created_wall: DateTime<Utc>,
    state: SessionState,
    participants: Vec<Participant>,
    emptied_at: Option<Instant>,
    closed_at: Option<Instant>,
}

impl Session {
    pub fn new(id: SessionId, host_name: impl Into<String>, capacity: usize, seq: u64) -> Self {
        Self {
            id,
            host_name: host_name.into(),
            capacity,
            seq,
            created_at: Instant::now(),
            created_wall: Utc::now(),
            state: SessionState::Open,
            participants: Vec::new(),
            emptied_at: None,
            closed_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// When an active session last lost its final participant.
    pub fn emptied_at(&self) -> Option<Instant> {
        self.emptied_at
    }

    pub fn closed_at(&self) -> Option<Instant> {
        self.closed_at
    }

    /// Whether a new participant could bind right now.
    pub fn check_joinable(&self) -> Result<(), LobbyError> {
        if self.is_closed() {
            return Err(LobbyError::SessionClosed(self.id.clone()));
        }
        if self.is_full() {
            return Err(LobbyError::Full {
                id: self.id.clone(),
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Bind a participant. The first join moves an `Open` session to `Active`.
    pub fn join(&mut self, participant: Participant) -> Result<(), LobbyError> {
        self.check_joinable()?;
        if participant.session_id != self.id {
            return Err(LobbyError::Internal(format!(
                "participant {} belongs to {}, not {}",
                participant.connection_id, participant.session_id, self.id
            )));
        }
        if self
            .participants
            .iter()
            .any(|p| p.connection_id == participant.connection_id)
        {
            return Err(LobbyError::InvalidRequest(format!(
                "connection {} is already bound",
                participant.connection_id
            )));
        }
        self.participants.push(participant);
        self.state = SessionState::Active;
        self.emptied_at = None;
        Ok(())
    }

    /// Unbind a participant, recording when the session became empty.
    pub fn leave(&mut self, connection_id: &ConnectionId, now: Instant) -> Option<Participant> {
        let idx = self
            .participants
            .iter()
            .position(|p| &p.connection_id == connection_id)?;
        let removed = self.participants.remove(idx);
        if self.participants.is_empty() && self.state == SessionState::Active {
            self.emptied_at = Some(now);
        }
        Some(removed)
    }

    /// Move to `Closed`. Returns false if the session was already closed.
    pub fn close(&mut self, now: Instant) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = SessionState::Closed;
        self.closed_at = Some(now);
        true
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            host_name: self.host_name.clone(),
            participant_count: self.participants.len(),
            capacity: self.capacity,
            participants: self
                .participants
                .iter()
                .map(|p| p.display_name.clone())
                .collect(),
            state: self.state,
            created_at: self.created_wall,
        }
    }
}

/// Discovery view of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub host_name: String,
    pub participant_count: usize,
    pub capacity: usize,
    pub participants: Vec<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}
