//! The multiplexing transport: many client streams, one engine.
//!
//! Client submissions are forwarded to the engine through a single inbound
//! channel. Replies are routed back to the session that sent the request when
//! that session is still connected. Everything else is broadcast.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use switchyard_rpc::{
    Envelope, MessageKind, RequestId, SendOptions, Transport, TransportError, TransportEvent,
};
use switchyard_settings::OrphanReplyPolicy;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::correlation::{CorrelationTable, PendingRequest};
use super::frame::Frame;
use super::heartbeat::HeartbeatScheduler;
use super::registry::SessionRegistry;
use super::session::{Session, SessionId};
use super::sink::{ClientSink, DeliveryFailure};
use crate::config::TransportConfig;
use crate::errors::MuxError;
use crate::metrics::{
    SSE_FRAMES_BROADCAST_TOTAL, SSE_FRAMES_TARGETED_TOTAL, SSE_MESSAGES_RECEIVED_TOTAL,
    SSE_MESSAGES_REJECTED_TOTAL, SSE_ORPHANED_REPLIES_TOTAL, SSE_SESSIONS_ACTIVE,
    SSE_SESSIONS_CLOSED_TOTAL, SSE_SESSIONS_OPENED_TOTAL, SSE_SESSIONS_PRUNED_TOTAL,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Started,
    Closed,
}

struct State {
    phase: Phase,
    sessions: SessionRegistry,
    pending: CorrelationTable,
    inbound: Option<mpsc::Sender<TransportEvent>>,
    inbound_rx: Option<mpsc::Receiver<TransportEvent>>,
    heartbeat: Option<HeartbeatScheduler>,
}

struct Inner {
    config: TransportConfig,
    state: Mutex<State>,
}

/// Serves one engine to any number of SSE client sessions.
pub struct MultiplexingTransport {
    inner: Arc<Inner>,
}

impl MultiplexingTransport {
    /// Create an idle transport. Call [`Transport::start`] to attach an engine.
    pub fn new(config: TransportConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        let state = State {
            phase: Phase::Idle,
            sessions: SessionRegistry::new(),
            pending: CorrelationTable::new(),
            inbound: Some(tx),
            inbound_rx: Some(rx),
            heartbeat: None,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
            }),
        }
    }

    /// The transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Register a client stream and send it the endpoint handshake.
    pub fn add_client(&self, session_id: SessionId, sink: ClientSink) -> Result<(), MuxError> {
        let handshake = Frame::Endpoint(format!(
            "{}?sessionId={}",
            self.inner.config.message_endpoint, session_id
        ));

        let (replaced, active) = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Closed {
                return Err(MuxError::Closed);
            }
            let replaced = state.sessions.add(
                Session::new(session_id.clone(), sink),
                self.inner.config.duplicate_sessions,
            )?;
            if let Some(Err(failure)) = state.sessions.write_to(&session_id, handshake.encode()) {
                debug!(session_id = %session_id, reason = failure.reason(), "handshake not delivered");
                if let Some(session) = state.sessions.remove(&session_id) {
                    session.sink.end();
                }
            }
            (replaced, state.sessions.len())
        };

        if let Some(previous) = replaced {
            warn!(session_id = %session_id, "session id reused, previous stream ended");
            previous.sink.end();
            counter!(SSE_SESSIONS_CLOSED_TOTAL).increment(1);
        }
        counter!(SSE_SESSIONS_OPENED_TOTAL).increment(1);
        record_active(active);
        info!(session_id = %session_id, sessions = active, "client session added");
        Ok(())
    }

    /// Unregister a client stream and end it.
    ///
    /// Pending requests from the session stay recorded, so their replies
    /// fall back to the orphan policy. Returns whether the session existed.
    pub fn remove_client(&self, session_id: &SessionId) -> bool {
        let (removed, active) = {
            let mut state = self.inner.state.lock();
            (state.sessions.remove(session_id), state.sessions.len())
        };
        let Some(session) = removed else {
            debug!(session_id = %session_id, "remove for unknown session ignored");
            return false;
        };
        session.sink.end();
        counter!(SSE_SESSIONS_CLOSED_TOTAL).increment(1);
        record_active(active);
        info!(session_id = %session_id, sessions = active, "client session removed");
        true
    }

    /// Accept a raw message submitted by a client and forward it to the engine.
    ///
    /// A request (`method` and `id`) is recorded against the session before it
    /// is forwarded, and its id is replaced by one unique to this transport.
    /// If forwarding fails or is abandoned, the record is undone.
    #[instrument(skip(self, raw), fields(session_id = %session_id, bytes = raw.len()))]
    pub async fn handle_client_message(&self, session_id: &SessionId, raw: &str) -> Result<(), MuxError> {
        let mut message = Envelope::parse(raw).map_err(|error| {
            counter!(SSE_MESSAGES_REJECTED_TOTAL, "reason" => "malformed").increment(1);
            warn!(%error, "rejecting malformed client message");
            MuxError::MalformedMessage(error)
        })?;
        let kind = message.kind();

        let (inbound, guard) = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Closed {
                return Err(MuxError::Closed);
            }
            if !state.sessions.contains(session_id) {
                counter!(SSE_MESSAGES_REJECTED_TOTAL, "reason" => "unknown_session").increment(1);
                return Err(MuxError::SessionNotFound(session_id.clone()));
            }
            let inbound = state.inbound.clone().ok_or(MuxError::Closed)?;
            let guard = match (message.id.take(), kind) {
                (Some(client_id), MessageKind::Request) => {
                    let upstream_id = state.pending.record(client_id.clone(), session_id.clone());
                    debug!(%client_id, %upstream_id, "request recorded");
                    message.id = Some(upstream_id.clone());
                    Some(PendingGuard {
                        inner: &self.inner,
                        upstream_id,
                        armed: true,
                    })
                }
                (id, _) => {
                    message.id = id;
                    None
                }
            };
            (inbound, guard)
        };

        debug!(?kind, method = message.method.as_deref().unwrap_or_default(), "forwarding client message");
        if inbound.send(TransportEvent::Message(message)).await.is_err() {
            warn!("engine is not reading client messages");
            return Err(MuxError::UpstreamUnavailable);
        }
        if let Some(guard) = guard {
            guard.disarm();
        }
        counter!(SSE_MESSAGES_RECEIVED_TOTAL).increment(1);
        Ok(())
    }

    /// Whether `session_id` is connected.
    pub fn has_session(&self, session_id: &SessionId) -> bool {
        self.inner.state.lock().sessions.contains(session_id)
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Whether [`Transport::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().phase == Phase::Closed
    }
}

#[async_trait]
impl Transport for MultiplexingTransport {
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let mut state = self.inner.state.lock();
        match state.phase {
            Phase::Closed => return Err(TransportError::Closed),
            Phase::Started => return Err(TransportError::AlreadyStarted),
            Phase::Idle => {}
        }
        let events = state.inbound_rx.take().ok_or(TransportError::AlreadyStarted)?;

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        state.heartbeat = Some(HeartbeatScheduler::spawn(
            self.inner.config.heartbeat_interval,
            move || {
                weak.upgrade().is_some_and(|inner| {
                    inner.beat();
                    true
                })
            },
        ));
        state.phase = Phase::Started;
        info!(
            heartbeat_ms = self.inner.config.heartbeat_interval.as_millis(),
            endpoint = %self.inner.config.message_endpoint,
            "multiplexing transport started"
        );
        Ok(events)
    }

    async fn send(&self, message: Envelope, options: SendOptions) -> Result<(), TransportError> {
        let reply_to = options
            .related_request_id
            .filter(|_| message.is_response());
        self.inner.deliver(message, reply_to.as_ref())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (sessions, heartbeat, inbound) = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Closed {
                return Ok(());
            }
            state.phase = Phase::Closed;
            state.pending.clear();
            state.inbound_rx = None;
            (
                state.sessions.drain(),
                state.heartbeat.take(),
                state.inbound.take(),
            )
        };

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        let count = sessions.len();
        for session in sessions {
            session.sink.end();
        }
        counter!(SSE_SESSIONS_CLOSED_TOTAL).increment(count as u64);
        record_active(0);

        if let Some(inbound) = inbound {
            if let Err(error) = inbound.try_send(TransportEvent::Closed) {
                debug!(%error, "close not queued, engine will see the channel end");
            }
        }
        info!(sessions = count, "multiplexing transport closed");
        Ok(())
    }
}

impl Inner {
    /// Write a heartbeat to every session and prune the dead ones.
    fn beat(&self) {
        let (pruned, inbound, active) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            let outcome = state.sessions.fan_out(&Frame::Heartbeat);
            (outcome.pruned, state.inbound.clone(), state.sessions.len())
        };
        if !pruned.is_empty() {
            record_active(active);
            report_pruned(&pruned, inbound.as_ref());
        }
    }

    fn deliver(&self, mut message: Envelope, reply_to: Option<&RequestId>) -> Result<(), TransportError> {
        let (pruned, inbound, active) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                debug!(kind = ?message.kind(), "transport closed, outbound message discarded");
                return Ok(());
            }

            // The entry is taken before framing so the client's own id goes out.
            let reply = reply_to.map(|upstream_id| (upstream_id, state.pending.resolve(upstream_id)));
            if let Some((_, Some(pending))) = &reply {
                message.id = Some(pending.client_id.clone());
            }
            let frame = Frame::message(&message)?;

            let mut pruned = Vec::new();
            let broadcast = match reply {
                Some((upstream_id, pending)) => {
                    self.route_reply(&mut state, upstream_id, pending, &frame, &mut pruned)
                }
                None => true,
            };
            if broadcast {
                let outcome = state.sessions.fan_out(&frame);
                counter!(SSE_FRAMES_BROADCAST_TOTAL).increment(1);
                debug!(delivered = outcome.delivered, pruned = outcome.pruned.len(), "message broadcast");
                pruned.extend(outcome.pruned);
            }
            (pruned, state.inbound.clone(), state.sessions.len())
        };
        if !pruned.is_empty() {
            record_active(active);
            report_pruned(&pruned, inbound.as_ref());
        }
        Ok(())
    }

    /// Try the requesting session. Returns `true` when the reply should be broadcast.
    fn route_reply(
        &self,
        state: &mut State,
        upstream_id: &RequestId,
        pending: Option<PendingRequest>,
        frame: &Frame,
        pruned: &mut Vec<(SessionId, DeliveryFailure)>,
    ) -> bool {
        match pending {
            Some(PendingRequest {
                session_id,
                client_id,
            }) => match state.sessions.write_to(&session_id, frame.encode()) {
                Some(Ok(())) => {
                    counter!(SSE_FRAMES_TARGETED_TOTAL).increment(1);
                    debug!(request_id = %client_id, session_id = %session_id, "reply delivered");
                    return false;
                }
                Some(Err(failure)) => {
                    if let Some(session) = state.sessions.remove(&session_id) {
                        session.sink.end();
                    }
                    pruned.push((session_id, failure));
                }
                None => debug!(request_id = %client_id, session_id = %session_id, "requesting session is gone"),
            },
            None => debug!(%upstream_id, "reply has no pending request"),
        }

        let policy = self.config.orphaned_replies;
        counter!(SSE_ORPHANED_REPLIES_TOTAL, "policy" => policy_label(policy)).increment(1);
        match policy {
            OrphanReplyPolicy::Broadcast => true,
            OrphanReplyPolicy::Drop => {
                info!(%upstream_id, "orphaned reply dropped");
                false
            }
        }
    }
}

/// Undoes a correlation record unless disarmed.
struct PendingGuard<'a> {
    inner: &'a Inner,
    upstream_id: RequestId,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.inner.state.lock().pending.discard(&self.upstream_id) {
            debug!(upstream_id = %self.upstream_id, "pending request rolled back");
        }
    }
}

fn report_pruned(pruned: &[(SessionId, DeliveryFailure)], inbound: Option<&mpsc::Sender<TransportEvent>>) {
    for (session_id, failure) in pruned {
        counter!(SSE_SESSIONS_PRUNED_TOTAL, "reason" => failure.reason()).increment(1);
        counter!(SSE_SESSIONS_CLOSED_TOTAL).increment(1);
        warn!(session_id = %session_id, reason = failure.reason(), "client stream failed, session removed");
        if let Some(inbound) = inbound {
            let event = TransportEvent::Error(format!("delivery to session {session_id} failed: {failure}"));
            if inbound.try_send(event).is_err() {
                debug!(session_id = %session_id, "engine not accepting transport errors");
            }
        }
    }
}

fn policy_label(policy: OrphanReplyPolicy) -> &'static str {
    match policy {
        OrphanReplyPolicy::Broadcast => "broadcast",
        OrphanReplyPolicy::Drop => "drop",
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_active(sessions: usize) {
    gauge!(SSE_SESSIONS_ACTIVE).set(sessions as f64);
}
