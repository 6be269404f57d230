//! Transport contract between an engine and whatever carries its messages.
//!
//! An engine calls [`Transport::start`] once to receive the inbound event
//! stream, replies through [`Transport::send`], and may [`Transport::close`]
//! the transport. The end of the event stream also means the transport closed.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::{Envelope, RequestId};

/// Per-send routing hints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// The inbound request this message answers, if any.
    pub related_request_id: Option<RequestId>,
}

impl SendOptions {
    /// Options for a reply to `id`.
    pub fn related(id: RequestId) -> Self {
        Self {
            related_request_id: Some(id),
        }
    }
}

/// Events flowing from a transport to its engine.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A client message to process.
    Message(Envelope),
    /// A non-fatal transport failure (e.g. a client stream died mid-write).
    Error(String),
    /// The transport closed. Sent at most once.
    Closed,
}

/// Errors surfaced by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `start()` was already called.
    #[error("transport already started")]
    AlreadyStarted,
    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
    /// The outbound envelope could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The shape every engine-facing transport implements.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Prepare the transport and hand out its inbound event stream.
    ///
    /// Callable exactly once.
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Deliver an outbound message.
    async fn send(&self, message: Envelope, options: SendOptions) -> Result<(), TransportError>;

    /// Tear the transport down. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;

    #[test]
    fn default_options_have_no_related_id() {
        assert!(SendOptions::default().related_request_id.is_none());
    }

    #[test]
    fn related_options_carry_id() {
        let opts = SendOptions::related(RequestId::from(42));
        assert_eq!(opts.related_request_id, Some(RequestId::Number(42)));
    }

    #[test]
    fn error_display() {
        assert_eq!(TransportError::AlreadyStarted.to_string(), "transport already started");
        assert_eq!(TransportError::Closed.to_string(), "transport closed");
    }
}
