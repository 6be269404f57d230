//! Session identity and state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sink::ClientSink;

/// Identifier of one client event stream (UUID v7, time-ordered).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A connected client: its id and the writing half of its stream.
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Outbound queue.
    pub sink: ClientSink,
    /// When the client connected.
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Create a session stamped with the current time.
    pub fn new(id: SessionId, sink: ClientSink) -> Self {
        Self {
            id,
            sink,
            created_at: Utc::now(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("open", &self.sink.is_open())
            .field("created_at", &self.created_at)
            .finish()
    }
}
