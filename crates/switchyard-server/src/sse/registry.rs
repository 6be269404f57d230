//! Connected sessions indexed by id.

use std::collections::HashMap;

use bytes::Bytes;
use switchyard_settings::DuplicateSessionPolicy;
use tracing::debug;

use super::frame::Frame;
use super::session::{Session, SessionId};
use super::sink::DeliveryFailure;

/// Errors raised by registry mutations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The id is already registered and the policy is `Reject`.
    #[error("session already registered: {0}")]
    DuplicateSession(SessionId),
}

/// Result of writing one frame to every session.
#[derive(Debug, Default)]
pub struct FanOut {
    /// Sessions that accepted the frame.
    pub delivered: usize,
    /// Sessions whose write failed. They are no longer registered.
    pub pruned: Vec<(SessionId, DeliveryFailure)>,
}

/// Owns every live [`Session`].
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    ///
    /// Under [`DuplicateSessionPolicy::Overwrite`] a session already holding
    /// the id is returned so the caller can end it.
    pub fn add(
        &mut self,
        session: Session,
        policy: DuplicateSessionPolicy,
    ) -> Result<Option<Session>, RegistryError> {
        if policy == DuplicateSessionPolicy::Reject && self.sessions.contains_key(&session.id) {
            return Err(RegistryError::DuplicateSession(session.id));
        }
        Ok(self.sessions.insert(session.id.clone(), session))
    }

    /// Unregister a session. Absent ids are a no-op.
    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id)
    }

    /// Look up a session.
    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Visit every session.
    pub fn for_each(&self, f: impl FnMut(&Session)) {
        self.sessions.values().for_each(f);
    }

    /// Queue bytes for one session. `None` if it is not registered.
    pub fn write_to(&self, id: &SessionId, bytes: Bytes) -> Option<Result<(), DeliveryFailure>> {
        self.sessions.get(id).map(|s| s.sink.write(bytes))
    }

    /// Write `frame` to every session, removing each one whose write fails.
    pub fn fan_out(&mut self, frame: &Frame) -> FanOut {
        let bytes = frame.encode();
        let mut outcome = FanOut::default();

        for session in self.sessions.values() {
            match session.sink.write(bytes.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(failure) => outcome.pruned.push((session.id.clone(), failure)),
            }
        }
        for (id, failure) in &outcome.pruned {
            debug!(session_id = %id, frame = frame.kind(), reason = failure.reason(), "pruning session");
            if let Some(session) = self.sessions.remove(id) {
                session.sink.end();
            }
        }
        outcome
    }

    /// Remove and return every session.
    pub fn drain(&mut self) -> Vec<Session> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::sse::sink::ClientSink;

    fn session(id: &str, capacity: usize) -> (Session, mpsc::Receiver<Bytes>) {
        let (sink, rx) = ClientSink::new(capacity);
        (Session::new(SessionId::from(id), sink), rx)
    }

    #[test]
    fn add_and_get() {
        let mut reg = SessionRegistry::new();
        let (s, _rx) = session("a", 4);
        assert!(reg.add(s, DuplicateSessionPolicy::Reject).unwrap().is_none());
        assert!(reg.get(&SessionId::from("a")).is_some());
        assert!(reg.contains(&SessionId::from("a")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_rejected() {
        let mut reg = SessionRegistry::new();
        let (a1, _rx1) = session("a", 4);
        let (a2, _rx2) = session("a", 4);
        reg.add(a1, DuplicateSessionPolicy::Reject).unwrap();
        let err = reg.add(a2, DuplicateSessionPolicy::Reject).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateSession(id) if id.as_str() == "a"));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_overwrites_and_returns_previous() {
        let mut reg = SessionRegistry::new();
        let (a1, mut rx1) = session("a", 4);
        let (a2, _rx2) = session("a", 4);
        reg.add(a1, DuplicateSessionPolicy::Overwrite).unwrap();
        let previous = reg.add(a2, DuplicateSessionPolicy::Overwrite).unwrap().unwrap();
        previous.sink.end();
        assert!(rx1.recv().await.is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = SessionRegistry::new();
        let (b, _rx) = session("b", 4);
        reg.add(b, DuplicateSessionPolicy::Reject).unwrap();
        assert!(reg.remove(&SessionId::from("b")).is_some());
        assert!(reg.remove(&SessionId::from("b")).is_none());
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn fan_out_prunes_failures() {
        let mut reg = SessionRegistry::new();
        let (a, mut rx_a) = session("a", 4);
        let (b, rx_b) = session("b", 4);
        let (c, _rx_c) = session("c", 1);
        reg.add(a, DuplicateSessionPolicy::Reject).unwrap();
        reg.add(b, DuplicateSessionPolicy::Reject).unwrap();
        reg.add(c, DuplicateSessionPolicy::Reject).unwrap();
        drop(rx_b);
        // Fill c's queue so the next write overflows.
        reg.write_to(&SessionId::from("c"), Bytes::from_static(b"x")).unwrap().unwrap();

        let outcome = reg.fan_out(&Frame::Heartbeat);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.pruned.len(), 2);
        assert!(outcome
            .pruned
            .iter()
            .any(|(id, f)| id.as_str() == "b" && *f == DeliveryFailure::Closed));
        assert!(outcome
            .pruned
            .iter()
            .any(|(id, f)| id.as_str() == "c" && *f == DeliveryFailure::Full));
        assert_eq!(reg.len(), 1);
        assert_eq!(rx_a.recv().await.unwrap(), ":heartbeat\n\n");
    }

    #[test]
    fn fan_out_to_nobody() {
        let mut reg = SessionRegistry::new();
        let outcome = reg.fan_out(&Frame::Heartbeat);
        assert_eq!(outcome.delivered, 0);
        assert!(outcome.pruned.is_empty());
    }

    #[test]
    fn write_to_unknown_session() {
        let reg = SessionRegistry::new();
        assert!(reg.write_to(&SessionId::from("nope"), Bytes::new()).is_none());
    }

    #[test]
    fn for_each_and_drain() {
        let mut reg = SessionRegistry::new();
        let (a, _ra) = session("a", 4);
        let (b, _rb) = session("b", 4);
        reg.add(a, DuplicateSessionPolicy::Reject).unwrap();
        reg.add(b, DuplicateSessionPolicy::Reject).unwrap();

        let mut seen = Vec::new();
        reg.for_each(|s| seen.push(s.id.to_string()));
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);

        assert_eq!(reg.drain().len(), 2);
        assert!(reg.is_empty());
    }
}
