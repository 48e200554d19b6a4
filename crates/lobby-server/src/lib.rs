pub mod connection;
pub mod handlers;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
