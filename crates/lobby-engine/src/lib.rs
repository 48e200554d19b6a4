pub mod discovery;
pub mod engine;
pub mod handshake;
pub mod host;
pub mod lifecycle;
pub mod registry;

pub use discovery::DiscoveryService;
pub use engine::{EngineConfig, LobbyEngine};
pub use handshake::{Handshake, HandshakeGateway, HandshakeState, JoinRequest, RejectReason};
pub use host::{HostLimits, HostRequest, HostResponse, HostService};
pub use lifecycle::{
    LifecycleCounters, LifecycleEvent, LifecyclePolicy, LifecycleStats, SessionLifecycleManager,
};
pub use registry::SessionRegistry;
