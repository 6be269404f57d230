//! Server error types.

use crate::sse::registry::RegistryError;
use crate::sse::session::SessionId;

/// Errors returned by the multiplexing transport's client-facing operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// No session with this id is connected.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    /// The id is already connected and duplicates are rejected.
    #[error("session already registered: {0}")]
    DuplicateSession(SessionId),
    /// The submitted payload is not a JSON-RPC envelope.
    #[error("invalid message: {0}")]
    MalformedMessage(#[source] serde_json::Error),
    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
    /// The engine is no longer reading client messages.
    #[error("upstream engine unavailable")]
    UpstreamUnavailable,
}

impl From<RegistryError> for MuxError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateSession(id) => Self::DuplicateSession(id),
        }
    }
}

/// Errors raised while starting the HTTP server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// No candidate port could be bound.
    #[error("could not bind {host} on ports {first}..={last}: {source}")]
    Bind {
        /// Host that was tried.
        host: String,
        /// First port tried.
        first: u16,
        /// Last port tried.
        last: u16,
        /// Error from the last attempt.
        #[source]
        source: std::io::Error,
    },
}
