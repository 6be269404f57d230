//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Transport metrics. The engine records `rpc_*` series under its own names.

/// Client streams opened (counter).
pub const SSE_SESSIONS_OPENED_TOTAL: &str = "sse_sessions_opened_total";
/// Client streams closed or pruned (counter).
pub const SSE_SESSIONS_CLOSED_TOTAL: &str = "sse_sessions_closed_total";
/// Connected client streams (gauge).
pub const SSE_SESSIONS_ACTIVE: &str = "sse_sessions_active";
/// Sessions removed after a failed write (counter, labels: reason).
pub const SSE_SESSIONS_PRUNED_TOTAL: &str = "sse_sessions_pruned_total";
/// Replies delivered to their requesting session (counter).
pub const SSE_FRAMES_TARGETED_TOTAL: &str = "sse_frames_targeted_total";
/// Messages written to every session (counter).
pub const SSE_FRAMES_BROADCAST_TOTAL: &str = "sse_frames_broadcast_total";
/// Replies whose requester was gone (counter, labels: policy).
pub const SSE_ORPHANED_REPLIES_TOTAL: &str = "sse_orphaned_replies_total";
/// Client messages forwarded to the engine (counter).
pub const SSE_MESSAGES_RECEIVED_TOTAL: &str = "sse_messages_received_total";
/// Client messages rejected (counter, labels: reason).
pub const SSE_MESSAGES_REJECTED_TOTAL: &str = "sse_messages_rejected_total";
