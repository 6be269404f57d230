//! Request id to originating session mapping.
//!
//! Clients pick their own request ids, so two sessions routinely use the same
//! one. Every forwarded request is therefore given an id that is unique within
//! the transport, and the table maps it back to the session and the id that
//! session chose.

use std::collections::HashMap;

use switchyard_rpc::RequestId;

use super::session::SessionId;

/// A forwarded request awaiting its reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    /// Session the reply belongs to.
    pub session_id: SessionId,
    /// Id the client used, restored on the reply.
    pub client_id: RequestId,
}

/// Outstanding requests keyed by the id the engine sees.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<RequestId, PendingRequest>,
    last_issued: i64,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session_id` is waiting on its request `client_id`.
    ///
    /// Returns the upstream id to forward in place of `client_id`. Issued ids
    /// are never reused, even after [`clear`](Self::clear).
    pub fn record(&mut self, client_id: RequestId, session_id: SessionId) -> RequestId {
        self.last_issued += 1;
        let upstream_id = RequestId::Number(self.last_issued);
        let _ = self.pending.insert(
            upstream_id.clone(),
            PendingRequest {
                session_id,
                client_id,
            },
        );
        upstream_id
    }

    /// Take the request behind `upstream_id`, removing the entry.
    pub fn resolve(&mut self, upstream_id: &RequestId) -> Option<PendingRequest> {
        self.pending.remove(upstream_id)
    }

    /// Remove the entry for `upstream_id`. Returns whether it existed.
    pub fn discard(&mut self, upstream_id: &RequestId) -> bool {
        self.pending.remove(upstream_id).is_some()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
