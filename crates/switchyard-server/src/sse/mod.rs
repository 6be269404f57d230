//! SSE sessions, framing, reply routing, heartbeat, and the HTTP lifecycle.

pub mod correlation;
pub mod frame;
pub mod heartbeat;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod sink;
pub mod transport;

pub use frame::Frame;
pub use session::{Session, SessionId};
pub use sink::{ClientSink, DeliveryFailure};
pub use transport::MultiplexingTransport;
