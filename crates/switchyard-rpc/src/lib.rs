//! # switchyard-rpc
//!
//! JSON-RPC protocol layer shared by the gateway and its upstream engine.
//!
//! - [`envelope`]: the wire envelope, request ids, and message classification
//! - [`errors`]: JSON-RPC error codes and the handler error type
//! - [`transport`]: the start / send / close contract an engine attaches to
//! - [`engine`]: method registry, dispatch, and the engine event loop
//! - [`handlers`]: built-in `initialize`, `ping`, and `tools/*` methods
//! - [`tools`]: the `Tool` trait and tool registry behind `tools/*`

#![deny(unsafe_code)]

pub mod engine;
pub mod envelope;
pub mod errors;
pub mod handlers;
pub mod tools;
pub mod transport;

pub use envelope::{Envelope, ErrorObject, MessageKind, RequestId};
pub use errors::RpcError;
pub use transport::{SendOptions, Transport, TransportError, TransportEvent};
