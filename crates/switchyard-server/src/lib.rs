//! # switchyard-server
//!
//! SSE multiplexing transport and the Axum HTTP gateway around it.
//!
//! - [`sse`]: sessions, framing, reply routing, heartbeat, and the
//!   `GET /sse` / `POST /messages` lifecycle
//! - [`server`]: router, CORS, body limit, port probing
//! - [`health`]: the `/health` response
//! - [`metrics`]: Prometheus recorder and metric names
//! - [`shutdown`]: graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod sse;

pub use config::{ServerConfig, TransportConfig, from_settings};
pub use errors::{MuxError, ServerError};
pub use server::{GatewayServer, ServerHandle};
pub use shutdown::ShutdownCoordinator;
pub use sse::{ClientSink, MultiplexingTransport, SessionId};
