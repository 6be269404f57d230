//! HTTP boundary that opens client streams and accepts their submissions.
//!
//! `GET /sse` registers a session and streams its frames. Dropping the
//! response body (client disconnect, idle timeout, server shutdown) removes
//! the session again. `POST /messages?sessionId=<id>` hands the raw body to
//! the transport.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::session::SessionId;
use super::sink::ClientSink;
use super::transport::MultiplexingTransport;
use crate::errors::MuxError;
use crate::server::AppState;

/// Query string of `POST /messages`.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitQuery {
    /// Session the message belongs to.
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// `GET /sse`: open a client stream.
pub async fn open_stream(State(state): State<AppState>) -> Response {
    let session_id = SessionId::new();
    let (sink, frames) = ClientSink::new(state.transport.config().sink_capacity);
    if let Err(error) = state.transport.add_client(session_id.clone(), sink) {
        warn!(%error, "client stream refused");
        return mux_error_response(&error);
    }

    let stream = SessionStream::new(
        session_id,
        frames,
        Arc::clone(&state.transport),
        state.config.stream_timeout,
    );
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// `POST /messages?sessionId=<id>`: submit one JSON-RPC message.
pub async fn submit_message(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    body: Bytes,
) -> Response {
    let Some(session_id) = query
        .session_id
        .filter(|id| !id.is_empty())
        .map(SessionId::from)
    else {
        return error_response(StatusCode::BAD_REQUEST, "Missing sessionId parameter");
    };
    let Ok(raw) = std::str::from_utf8(&body) else {
        debug!(session_id = %session_id, "submitted body is not UTF-8");
        return error_response(StatusCode::BAD_REQUEST, "Invalid message");
    };

    let submitted = tokio::time::timeout(
        state.config.request_timeout,
        state.transport.handle_client_message(&session_id, raw),
    )
    .await;
    match submitted {
        Ok(Ok(())) => (StatusCode::ACCEPTED, "Accepted").into_response(),
        Ok(Err(error)) => mux_error_response(&error),
        Err(_) => {
            warn!(
                session_id = %session_id,
                timeout_ms = state.config.request_timeout.as_millis(),
                "message not accepted in time"
            );
            error_response(StatusCode::REQUEST_TIMEOUT, "Request timeout")
        }
    }
}

/// JSON error body `{"error": message}`.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn mux_error_response(error: &MuxError) -> Response {
    let (status, message) = match error {
        MuxError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "Session not found"),
        MuxError::MalformedMessage(_) => (StatusCode::BAD_REQUEST, "Invalid message"),
        MuxError::DuplicateSession(_) => (StatusCode::CONFLICT, "Session already exists"),
        MuxError::Closed | MuxError::UpstreamUnavailable => {
            (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable")
        }
    };
    error_response(status, message)
}

/// Response body of one client stream.
///
/// Ends when the sink is ended or no frame arrives within the idle timeout.
/// Dropping it unregisters the session.
struct SessionStream {
    session_id: SessionId,
    frames: ReceiverStream<Bytes>,
    transport: Arc<MultiplexingTransport>,
    idle: Pin<Box<Sleep>>,
    idle_timeout: Duration,
}

impl SessionStream {
    fn new(
        session_id: SessionId,
        frames: mpsc::Receiver<Bytes>,
        transport: Arc<MultiplexingTransport>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            frames: ReceiverStream::new(frames),
            transport,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_timeout,
        }
    }
}

impl Stream for SessionStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.frames.poll_next_unpin(cx) {
            Poll::Ready(Some(frame)) => {
                this.idle.as_mut().reset(Instant::now() + this.idle_timeout);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => {
                if this.idle.as_mut().poll(cx).is_ready() {
                    info!(session_id = %this.session_id, "client stream idle, closing");
                    Poll::Ready(None)
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        let _ = self.transport.remove_client(&self.session_id);
    }
}
