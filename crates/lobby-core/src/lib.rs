pub mod errors;
pub mod ids;
pub mod session;

pub use errors::LobbyError;
pub use ids::{ConnectionId, SessionId};
pub use session::{Participant, Session, SessionState, SessionSummary};
