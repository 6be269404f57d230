//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a partial JSON file fills the
//! rest from the compiled defaults. Field names are camelCase on disk.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// HTTP server settings.
    pub server: ServerSettings,
    /// SSE transport settings.
    pub transport: TransportSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Reject combinations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "server.portAttempts must be at least 1".into(),
            ));
        }
        if self.server.request_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.requestTimeoutMs must be positive".into(),
            ));
        }
        if self.transport.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "transport.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.transport.sink_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "transport.sinkCapacity must be at least 1".into(),
            ));
        }
        if !self.transport.message_endpoint.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "transport.messageEndpoint must start with '/': {}",
                self.transport.message_endpoint
            )));
        }
        Ok(())
    }
}

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// First port to try. `0` lets the OS pick.
    pub port: u16,
    /// How many consecutive ports to try when the first is busy.
    pub port_attempts: u16,
    /// Upper bound on handling one submitted message, and on one engine call.
    pub request_timeout_ms: u64,
    /// Idle timeout for a client's event stream.
    pub stream_timeout_ms: u64,
    /// Allowed CORS origin. `*` allows any.
    pub cors_allow_origin: String,
    /// Maximum accepted request body size.
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3200,
            port_attempts: 10,
            request_timeout_ms: 180_000,
            stream_timeout_ms: 1_800_000,
            cors_allow_origin: "*".to_string(),
            max_body_bytes: 300 * 1024 * 1024,
        }
    }
}

/// What to do with a reply whose requester can no longer be reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanReplyPolicy {
    /// Deliver to every connected session.
    #[default]
    Broadcast,
    /// Discard and log.
    Drop,
}

/// What to do when a session id is registered twice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateSessionPolicy {
    /// Refuse the second registration.
    #[default]
    Reject,
    /// Replace the existing session and end its stream.
    Overwrite,
}

/// SSE transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Interval between heartbeat comments.
    pub heartbeat_interval_ms: u64,
    /// Frames queued per session before writes count as failed.
    pub sink_capacity: usize,
    /// Path advertised in the endpoint handshake.
    pub message_endpoint: String,
    /// Fallback for replies whose owner is gone.
    pub orphaned_replies: OrphanReplyPolicy,
    /// Handling of reused session ids.
    pub duplicate_sessions: DuplicateSessionPolicy,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 20_000,
            sink_capacity: 1024,
            message_endpoint: "/messages".to_string(),
            orphaned_replies: OrphanReplyPolicy::Broadcast,
            duplicate_sessions: DuplicateSessionPolicy::Reject,
        }
    }
}

/// Log line encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single line.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Filter directive, e.g. `info` or `info,switchyard_server=debug`.
    pub level: String,
    /// Line encoding.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
