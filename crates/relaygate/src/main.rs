//! relaygate: secure relay gateway.
//!
//! Registers with the control plane, allocates a public TCP endpoint on a
//! TURN relay and serves mutually authenticated TLS connections arriving
//! through it, forwarding each to a local upstream service. Sessions are
//! restarted with backoff until the process is asked to stop.

mod backoff;
mod config;
mod control_plane;
mod gateway;
mod relay;

use backoff::RestartBackoff;
use clap::Parser;
use config::{CliOverrides, GatewayConfig};
use control_plane::HttpControlPlane;
use gateway::{Gateway, SessionOutcome, TcpForwardHandler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// relaygate: secure relay gateway
#[derive(Parser, Debug)]
#[command(name = "relaygate", version, about = "Secure relay gateway")]
struct Cli {
    /// Control-plane base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Gateway identity token
    #[arg(long, env = "RELAYGATE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Local upstream (host:port) verified connections are forwarded to
    #[arg(long)]
    forward_to: Option<String>,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Config file path
    #[arg(long, default_value = "~/.relaygate/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting relaygate");

    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(
        Some(&config_path),
        CliOverrides {
            api_url: cli.api_url,
            token: cli.token,
            forward_to: cli.forward_to,
            max_connections: cli.max_connections,
        },
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let control_plane =
        match HttpControlPlane::new(&config.api_url, &config.token, config.request_timeout) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to create control-plane client");
                std::process::exit(1);
            }
        };

    info!(
        api_url = %config.api_url,
        forward_to = %config.forward_to,
        max_connections = ?config.max_connections,
        "gateway configured"
    );

    let gateway = Gateway::new(
        Arc::new(control_plane),
        config.timings,
        config.max_connections,
    );
    let handler = Arc::new(TcpForwardHandler::new(
        config.forward_to.clone(),
        UPSTREAM_CONNECT_TIMEOUT,
    ));

    let parent = CancellationToken::new();
    {
        let parent = parent.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            parent.cancel();
        });
    }

    supervise(&gateway, handler, &parent).await;
    info!(state = %gateway.state(), "relaygate stopped");
}

/// Run sessions back to back until `parent` is cancelled.
async fn supervise(gateway: &Gateway, handler: Arc<TcpForwardHandler>, parent: &CancellationToken) {
    let mut backoff = RestartBackoff::new();
    loop {
        match gateway.run_session(parent, handler.clone()).await {
            SessionOutcome::Cancelled => return,
            SessionOutcome::Failed {
                error,
                reached_listening,
            } => {
                if reached_listening {
                    backoff.reset();
                }
                let delay = backoff.next_delay();
                warn!(error = %error, retry_in_secs = delay.as_secs(), "session ended, restarting");
                tokio::select! {
                    _ = parent.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
