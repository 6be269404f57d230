//! Per-session outbound queue.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Why a frame could not be queued for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    /// The response body reading the queue is gone.
    #[error("client stream closed")]
    Closed,
    /// The client is not draining its queue fast enough.
    #[error("client queue full")]
    Full,
}

impl DeliveryFailure {
    /// Short label for logs and metrics.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Full => "full",
        }
    }
}

/// Writing half of a client's event stream.
///
/// Writes never block. The reading half is the HTTP response body.
pub struct ClientSink {
    tx: mpsc::Sender<Bytes>,
}

impl ClientSink {
    /// Create a sink holding at most `capacity` unread frames.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a frame.
    pub fn write(&self, frame: Bytes) -> Result<(), DeliveryFailure> {
        self.tx.try_send(frame).map_err(|err| match err {
            TrySendError::Closed(_) => DeliveryFailure::Closed,
            TrySendError::Full(_) => DeliveryFailure::Full,
        })
    }

    /// Whether the reading half is still attached.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Finish the stream. Frames already queued are still delivered.
    pub fn end(self) {
        drop(self.tx);
    }
}
