//! Runtime configuration for the gateway server and its transport.

use std::time::Duration;

use switchyard_settings::{
    DuplicateSessionPolicy, GatewaySettings, OrphanReplyPolicy, ServerSettings, TransportSettings,
};

/// Configuration for the multiplexing transport.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Interval between heartbeat comments.
    pub heartbeat_interval: Duration,
    /// Unread frames a session may hold before writes fail.
    pub sink_capacity: usize,
    /// Unprocessed client messages buffered toward the engine.
    pub inbound_capacity: usize,
    /// Path advertised in the endpoint handshake.
    pub message_endpoint: String,
    /// Fallback for replies whose owner is gone.
    pub orphaned_replies: OrphanReplyPolicy,
    /// Handling of reused session ids.
    pub duplicate_sessions: DuplicateSessionPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&TransportSettings::default())
    }
}

impl From<&TransportSettings> for TransportConfig {
    fn from(s: &TransportSettings) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms),
            sink_capacity: s.sink_capacity,
            inbound_capacity: 1024,
            message_endpoint: s.message_endpoint.clone(),
            orphaned_replies: s.orphaned_replies,
            duplicate_sessions: s.duplicate_sessions,
        }
    }
}

/// Configuration for the HTTP server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// First port to try (`0` for auto-assign).
    pub port: u16,
    /// Consecutive ports to try when the first is busy.
    pub port_attempts: u16,
    /// Upper bound on accepting one submitted message.
    pub request_timeout: Duration,
    /// A client stream with no frame for this long is ended.
    pub stream_timeout: Duration,
    /// Allowed CORS origin. `*` allows any.
    pub cors_allow_origin: String,
    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
    /// Name reported by `/health`.
    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            port_attempts: 1,
            request_timeout: Duration::from_secs(180),
            stream_timeout: Duration::from_secs(1800),
            cors_allow_origin: "*".into(),
            max_body_bytes: 300 * 1024 * 1024,
            server_name: "switchyard".into(),
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            port_attempts: s.port_attempts,
            request_timeout: Duration::from_millis(s.request_timeout_ms),
            stream_timeout: Duration::from_millis(s.stream_timeout_ms),
            cors_allow_origin: s.cors_allow_origin.clone(),
            max_body_bytes: s.max_body_bytes,
            ..Self::default()
        }
    }
}

/// Split loaded settings into server and transport configuration.
pub fn from_settings(settings: &GatewaySettings) -> (ServerConfig, TransportConfig) {
    (
        ServerConfig::from(&settings.server),
        TransportConfig::from(&settings.transport),
    )
}
