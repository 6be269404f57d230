//! # switchyard
//!
//! Gateway binary: loads settings, attaches the tool engine to the
//! multiplexing transport, and serves it over SSE until a shutdown signal.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use switchyard_rpc::Transport;
use switchyard_rpc::engine::{Engine, ServerInfo};
use switchyard_rpc::tools::{EchoTool, ToolRegistry};
use switchyard_server::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;
use switchyard_server::{GatewayServer, MultiplexingTransport};
use switchyard_settings::loader::parse_enum;
use switchyard_settings::{GatewaySettings, OrphanReplyPolicy, RejectedOverride};
use tracing::{info, warn};

/// Switchyard SSE gateway.
#[derive(Parser, Debug)]
#[command(name = "switchyard", about = "Serve one tool engine to many SSE clients")]
struct Cli {
    /// Settings file (defaults to `~/.switchyard/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// First port to try (overrides settings, 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Log level filter (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// What to do with replies whose requester disconnected: `broadcast` or `drop`.
    #[arg(long, value_parser = parse_orphan_policy)]
    orphaned_replies: Option<OrphanReplyPolicy>,
}

impl Cli {
    /// Load settings from file and env, then apply flags on top.
    ///
    /// Ignored env overrides are returned so they can be logged once the
    /// subscriber is installed.
    fn resolve_settings(&self) -> Result<(GatewaySettings, Vec<RejectedOverride>)> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(switchyard_settings::settings_path);
        let (mut settings, rejected) =
            switchyard_settings::load_settings_with_report(&path, |name| std::env::var(name).ok())
                .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(policy) = self.orphaned_replies {
            settings.transport.orphaned_replies = policy;
        }
        settings.validate().context("Invalid settings")?;
        Ok((settings, rejected))
    }
}

fn parse_orphan_policy(value: &str) -> Result<OrphanReplyPolicy, String> {
    parse_enum(value).ok_or_else(|| format!("expected `broadcast` or `drop`, got `{value}`"))
}

/// Wait for Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
            _ = terminate.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let (settings, rejected) = args.resolve_settings()?;
    switchyard_logging::init_from_settings(&settings.logging);
    rejected.iter().for_each(RejectedOverride::log);

    let metrics = switchyard_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let (server_config, transport_config) = switchyard_server::from_settings(&settings);

    let transport = Arc::new(MultiplexingTransport::new(transport_config));

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    let engine = Arc::new(Engine::new(
        ServerInfo {
            name: server_config.server_name.clone(),
            version: env!("CARGO_PKG_VERSION").into(),
        },
        tools,
        server_config.request_timeout,
    ));
    let upstream: Arc<dyn Transport> = transport.clone();
    let engine = engine
        .connect(upstream)
        .await
        .context("Failed to attach engine to transport")?;

    let server = GatewayServer::new(server_config, Arc::clone(&transport)).with_metrics(metrics);
    let handle = server.listen().await.context("Failed to bind server")?;
    info!(
        "switchyard listening on http://{}/sse",
        handle.local_addr()
    );

    shutdown_signal().await?;

    info!("shutting down");
    transport
        .close()
        .await
        .context("Failed to close transport")?;
    server
        .shutdown()
        .graceful_shutdown(vec![handle.into_task()], None)
        .await;
    if !engine.join_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await {
        warn!(
            timeout_ms = DEFAULT_SHUTDOWN_TIMEOUT.as_millis(),
            "engine still answering requests, abandoning them"
        );
    }

    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["switchyard"]);
        assert!(cli.config.is_none());
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(cli.orphaned_replies.is_none());
    }

    #[test]
    fn cli_parses_overrides() {
        let cli = Cli::parse_from([
            "switchyard",
            "--host",
            "0.0.0.0",
            "--port",
            "4000",
            "--log-level",
            "debug",
            "--orphaned-replies",
            "DROP",
        ]);
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.port, Some(4000));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.orphaned_replies, Some(OrphanReplyPolicy::Drop));
    }

    #[test]
    fn cli_rejects_unknown_policy() {
        let result = Cli::try_parse_from(["switchyard", "--orphaned-replies", "sometimes"]);
        assert!(result.is_err());
    }

    #[test]
    fn flags_override_file_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"host":"10.0.0.1","port":3300}}"#).unwrap();

        let cli = Cli::parse_from([
            "switchyard",
            "--config",
            path.to_str().unwrap(),
            "--host",
            "127.0.0.2",
        ]);
        let (settings, _) = cli.resolve_settings().unwrap();
        assert_eq!(settings.server.host, "127.0.0.2");
    }

    #[test]
    fn rejected_override_logs_a_warning() {
        let (logs, _guard) = switchyard_logging::capture_logs();
        let rejected = RejectedOverride {
            key: "MCP_SSE_PORT",
            value: "99999".into(),
            expected: "integer in 0..=65535".into(),
        };
        rejected.log();
        assert!(logs.has_event(tracing::Level::WARN, "invalid env var, ignoring"));
    }

    #[test]
    fn invalid_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let cli = Cli::parse_from(["switchyard", "--config", path.to_str().unwrap()]);
        let err = cli.resolve_settings().unwrap_err();
        assert!(err.to_string().contains("Failed to load settings"));
    }
}
