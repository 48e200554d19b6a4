use crate::ids::SessionId;

/// Error taxonomy shared by the registry, services and transport.
///
/// `NotFound` is the registry-level lookup failure; callers at the protocol
/// edge translate it into `SessionGone`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    // Client must fix its input
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Expected races between discovery and connection
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session gone: {0}")]
    SessionGone(SessionId),

    // Terminal for this attempt
    #[error("session closed: {0}")]
    SessionClosed(SessionId),
    #[error("session full: {id} (capacity {capacity})")]
    Full { id: SessionId, capacity: usize },

    #[error("internal failure: {0}")]
    Internal(String),
}

impl LobbyError {
    /// The caller should refresh the session list and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::SessionGone(_))
    }

    /// Nothing the caller can do will make this attempt succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionClosed(_) | Self::Full { .. })
    }

    /// Short classification string for logs and error bodies.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::SessionGone(_) => "SESSION_GONE",
            Self::SessionClosed(_) => "SESSION_CLOSED",
            Self::Full { .. } => "FULL",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::NotFound(_) | Self::SessionGone(_) => 404,
            Self::Full { .. } => 409,
            Self::SessionClosed(_) => 410,
            Self::Internal(_) => 500,
        }
    }

    /// Lookup failures become `SessionGone` once they cross the protocol edge.
    pub fn into_protocol(self) -> Self {
        match self {
            Self::NotFound(id) => Self::SessionGone(id),
            other => other,
        }
    }
}
