use std::sync::Arc;

use lobby_core::{ConnectionId, LobbyError, Participant, Session, SessionId, SessionSummary};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::host::validate_display_name;
use crate::lifecycle::LifecycleEvent;
use crate::registry::SessionRegistry;

/// Why a connection attempt was refused. Each reason maps to a WebSocket
/// close code in the private-use range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    SessionGone,
    SessionClosed,
    Full,
    InvalidRequest,
    HandshakeTimeout,
    Internal,
}

impl RejectReason {
    pub fn close_code(self) -> u16 {
        match self {
            Self::InvalidRequest => 4400,
            Self::SessionGone => 4404,
            Self::HandshakeTimeout => 4408,
            Self::Full => 4409,
            Self::SessionClosed => 4410,
            Self::Internal => 1011,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionGone => "SessionGone",
            Self::SessionClosed => "SessionClosed",
            Self::Full => "Full",
            Self::InvalidRequest => "InvalidRequest",
            Self::HandshakeTimeout => "HandshakeTimeout",
            Self::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&LobbyError> for RejectReason {
    fn from(err: &LobbyError) -> Self {
        match err {
            LobbyError::InvalidRequest(_) => Self::InvalidRequest,
            LobbyError::NotFound(_) | LobbyError::SessionGone(_) => Self::SessionGone,
            LobbyError::SessionClosed(_) => Self::SessionClosed,
            LobbyError::Full { .. } => Self::Full,
            LobbyError::Internal(_) => Self::Internal,
        }
    }
}

/// What a connecting client asks for. `displayName` defaults to the
/// session's host name, so the host can connect with just the id.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub session_id: SessionId,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl JoinRequest {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Parse a join request sent as the first text frame.
    pub fn parse(text: &str) -> Result<Self, LobbyError> {
        serde_json::from_str(text)
            .map_err(|e| LobbyError::InvalidRequest(format!("malformed join request: {e}")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Pending,
    Bound {
        participant: Participant,
        session: SessionSummary,
    },
    Rejected {
        reason: RejectReason,
        detail: String,
    },
}

/// One connection attempt. Starts `Pending`; `Bound` and `Rejected` are
/// terminal and ignore further transitions.
#[derive(Clone, Debug)]
pub struct Handshake {
    connection_id: ConnectionId,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            state: HandshakeState::Pending,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == HandshakeState::Pending
    }

    pub fn bind(&mut self, participant: Participant, session: SessionSummary) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.state = HandshakeState::Bound {
            participant,
            session,
        };
        true
    }

    pub fn reject(&mut self, reason: RejectReason, detail: impl Into<String>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.state = HandshakeState::Rejected {
            reason,
            detail: detail.into(),
        };
        true
    }

    pub fn participant(&self) -> Option<&Participant> {
        match &self.state {
            HandshakeState::Bound { participant, .. } => Some(participant),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<RejectReason> {
        match &self.state {
            HandshakeState::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Resolves connection attempts to sessions and binds them as participants.
pub struct HandshakeGateway {
    registry: Arc<SessionRegistry>,
    events: mpsc::Sender<LifecycleEvent>,
    max_display_name_len: usize,
}

impl HandshakeGateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        events: mpsc::Sender<LifecycleEvent>,
        max_display_name_len: usize,
    ) -> Self {
        Self {
            registry,
            events,
            max_display_name_len,
        }
    }

    /// Run `handshake` to a terminal state for `request`.
    pub fn attempt(&self, handshake: &mut Handshake, request: JoinRequest) {
        if !handshake.is_pending() {
            return;
        }
        let connection_id = handshake.connection_id().clone();
        match self.try_bind(connection_id.clone(), request) {
            Ok((participant, session)) => {
                tracing::info!(
                    session_id = %session.id,
                    connection_id = %connection_id,
                    participants = session.participant_count,
                    "Participant bound"
                );
                self.notify(LifecycleEvent::Bound {
                    session_id: session.id.clone(),
                    connection_id,
                });
                let _ = handshake.bind(participant, session);
            }
            Err(err) => {
                let reason = RejectReason::from(&err);
                tracing::info!(
                    connection_id = %connection_id,
                    reason = %reason,
                    error = %err,
                    retryable = err.is_retryable(),
                    terminal = err.is_terminal(),
                    "Handshake rejected"
                );
                let _ = handshake.reject(reason, err.to_string());
            }
        }
    }

    fn try_bind(
        &self,
        connection_id: ConnectionId,
        request: JoinRequest,
    ) -> Result<(Participant, SessionSummary), LobbyError> {
        let session = self
            .registry
            .get(&request.session_id)
            .map_err(LobbyError::into_protocol)?;
        session.check_joinable()?;

        let display_name = match request.display_name {
            Some(name) => validate_display_name(&name, self.max_display_name_len)?,
            None => session.host_name.clone(),
        };
        let participant = Participant::new(connection_id, display_name, session.id.clone());

        // Capacity and state are re-checked under the entry lock; the read
        // above only produces early, cheap rejections.
        let committed = self
            .registry
            .update(&session.id, |s| s.join(participant.clone()))
            .map_err(LobbyError::into_protocol)?;
        Ok((participant, committed.summary()))
    }

    /// Unbind a participant after its transport went away. Returns the
    /// session as committed, or `None` if it no longer exists.
    pub fn release(&self, participant: &Participant) -> Option<Session> {
        let now = Instant::now();
        let result = self.registry.update(&participant.session_id, |s| {
            let _ = s.leave(&participant.connection_id, now);
            Ok(())
        });

        match result {
            Ok(session) => {
                let remaining = session.participant_count();
                tracing::info!(
                    session_id = %session.id,
                    connection_id = %participant.connection_id,
                    remaining,
                    "Participant released"
                );
                self.notify(LifecycleEvent::Left {
                    session_id: session.id.clone(),
                    connection_id: participant.connection_id.clone(),
                    remaining,
                });
                if let Some(at) = session.emptied_at().filter(|_| remaining == 0) {
                    self.notify(LifecycleEvent::SessionEmptied {
                        session_id: session.id.clone(),
                        at,
                    });
                }
                Some(session)
            }
            Err(e) => {
                tracing::debug!(
                    session_id = %participant.session_id,
                    error = %e,
                    "Session already gone on release"
                );
                None
            }
        }
    }

    // Never blocks a handshake on the lifecycle task; the periodic sweep
    // covers anything dropped here.
    fn notify(&self, event: LifecycleEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(?event, "Lifecycle queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Lifecycle manager stopped, event discarded");
            }
        }
    }
}
