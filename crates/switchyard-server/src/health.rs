//! `/health` endpoint.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Time of the check, RFC 3339.
    pub timestamp: String,
    /// Gateway version.
    pub version: String,
    /// Configured server name.
    pub server_name: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Connected client streams.
    pub sessions: usize,
    /// Requests awaiting a reply.
    pub pending_requests: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    server_name: &str,
    sessions: usize,
    pending_requests: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").into(),
        server_name: server_name.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        sessions,
        pending_requests,
    }
}
