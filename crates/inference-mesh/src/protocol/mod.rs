//! Node-facing protocol: framing, transports and per-node sessions.

pub mod session;
pub mod transport;
pub mod wire;

pub use session::{JobEvent, JobTicket, NodeSession, SessionContext, SessionHandle, SessionState};
pub use transport::{memory_transport, NodeEndpoint, Transport};
pub use wire::{CoordinatorMessage, NodeMessage, DEFAULT_MAX_FRAME_BYTES};
