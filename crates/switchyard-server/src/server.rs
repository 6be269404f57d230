//! `GatewayServer`: Axum HTTP server in front of the multiplexing transport.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::sse::MultiplexingTransport;
use crate::sse::lifecycle::{self, error_response};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The transport every client stream is attached to.
    pub transport: Arc<MultiplexingTransport>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The gateway HTTP server.
pub struct GatewayServer {
    config: Arc<ServerConfig>,
    transport: Arc<MultiplexingTransport>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl GatewayServer {
    /// Create a server for `transport`.
    pub fn new(config: ServerConfig, transport: Arc<MultiplexingTransport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/sse", get(lifecycle::open_stream))
            .route(
                self.transport.config().message_endpoint.as_str(),
                post(lifecycle::submit_message),
            )
            .fallback(not_found)
            .with_state(state)
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(cors_layer(&self.config.cors_allow_origin))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind a listener, probing consecutive ports when the first is taken.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let host = self.config.host.as_str();
        let first = self.config.port;
        let attempts = if first == 0 { 1 } else { self.config.port_attempts.max(1) };
        let last = first.saturating_add(attempts - 1);

        let mut port = first;
        loop {
            match TcpListener::bind((host, port)).await {
                Ok(listener) => return Ok(listener),
                Err(source) if source.kind() == io::ErrorKind::AddrInUse && port < last => {
                    warn!(port, "port in use, trying next");
                    port += 1;
                }
                Err(source) => {
                    return Err(ServerError::Bind {
                        host: host.to_string(),
                        first,
                        last: port,
                        source,
                    });
                }
            }
        }
    }

    /// Bind and serve in a background task until shutdown is requested.
    pub async fn listen(&self) -> Result<ServerHandle, ServerError> {
        let listener = self.bind().await?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            host: self.config.host.clone(),
            first: self.config.port,
            last: self.config.port,
            source,
        })?;

        let router = self.router();
        let token = self.shutdown.token();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(token.cancelled_owned());
            if let Err(error) = serve.await {
                error!(%addr, %error, "server stopped with error");
            }
            info!(%addr, "server stopped");
        });

        info!(
            %addr,
            sse = "/sse",
            messages = %self.transport.config().message_endpoint,
            "gateway listening"
        );
        Ok(ServerHandle { addr, task })
    }

    /// The transport behind this server.
    pub fn transport(&self) -> &Arc<MultiplexingTransport> {
        &self.transport
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// A running server returned by [`GatewayServer::listen`].
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The serving task, for [`ShutdownCoordinator::graceful_shutdown`].
    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    if origin == "*" {
        return layer.allow_origin(Any);
    }
    match HeaderValue::from_str(origin) {
        Ok(value) => layer.allow_origin(value),
        Err(error) => {
            warn!(origin, %error, "invalid CORS origin, cross-origin requests disabled");
            layer
        }
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        &state.config.server_name,
        state.transport.session_count(),
        state.transport.pending_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Metrics not enabled"),
    }
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}
