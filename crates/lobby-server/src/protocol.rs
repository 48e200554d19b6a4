//! Frames the server originates on a bound connection. Frames sent by
//! participants are relayed as-is and never parsed.

use axum::extract::ws::Message;
use lobby_core::{ConnectionId, SessionId, SessionState};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Handshake succeeded; the socket is now the session's data channel.
    Bound {
        session_id: SessionId,
        connection_id: ConnectionId,
        display_name: String,
        participant_count: usize,
        state: SessionState,
    },
    ParticipantJoined {
        connection_id: ConnectionId,
        display_name: String,
        participant_count: usize,
    },
    ParticipantLeft {
        connection_id: ConnectionId,
        display_name: String,
        participant_count: usize,
    },
}

impl ServerFrame {
    /// Serialize into a text frame. `None` if serialization failed, in
    /// which case nothing should be sent.
    pub fn to_message(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize server frame");
                None
            }
        }
    }
}
