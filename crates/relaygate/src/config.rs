//! Gateway configuration: TOML file + CLI overrides.

use relaygate_core::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub control_plane: ControlPlaneSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub timing: TimingSection,
}

/// `[control_plane]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Gateway identity token. Usually supplied via `RELAYGATE_TOKEN` instead.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ControlPlaneSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// Local upstream every verified connection is piped to.
    #[serde(default = "default_forward_to")]
    pub forward_to: String,
    /// Concurrent connection cap, `0` = unlimited.
    #[serde(default)]
    pub max_connections: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            forward_to: default_forward_to(),
            max_connections: 0,
        }
    }
}

/// `[timing]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingSection {
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_heartbeat_initial_delay")]
    pub heartbeat_initial_delay_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_permission_refresh_interval")]
    pub permission_refresh_interval_secs: u64,
    #[serde(default = "default_probe_initial_delay")]
    pub probe_initial_delay_secs: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_dial_timeout")]
    pub relay_dial_timeout_secs: u64,
    #[serde(default = "default_transaction_timeout")]
    pub turn_transaction_timeout_secs: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            accept_poll_ms: default_accept_poll_ms(),
            handshake_timeout_secs: default_handshake_timeout(),
            grace_period_secs: default_grace_period(),
            heartbeat_initial_delay_secs: default_heartbeat_initial_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            permission_refresh_interval_secs: default_permission_refresh_interval(),
            probe_initial_delay_secs: default_probe_initial_delay(),
            probe_interval_secs: default_probe_interval(),
            relay_dial_timeout_secs: default_dial_timeout(),
            turn_transaction_timeout_secs: default_transaction_timeout(),
        }
    }
}

fn default_api_url() -> String {
    "https://app.relaygate.dev".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_forward_to() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_accept_poll_ms() -> u64 {
    1000
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_grace_period() -> u64 {
    5
}
fn default_heartbeat_initial_delay() -> u64 {
    10
}
fn default_heartbeat_interval() -> u64 {
    3600
}
fn default_permission_refresh_interval() -> u64 {
    180
}
fn default_probe_initial_delay() -> u64 {
    5
}
fn default_probe_interval() -> u64 {
    10
}
fn default_dial_timeout() -> u64 {
    10
}
fn default_transaction_timeout() -> u64 {
    10
}

/// Every deadline and interval a session runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Bound on each accept so the loop observes shutdown promptly.
    pub accept_poll: Duration,
    pub handshake_timeout: Duration,
    /// Drain window for in-flight connections after shutdown.
    pub grace_period: Duration,
    pub heartbeat_initial_delay: Duration,
    pub heartbeat_interval: Duration,
    pub permission_refresh_interval: Duration,
    pub probe_initial_delay: Duration,
    pub probe_interval: Duration,
    pub relay_dial_timeout: Duration,
    pub turn_transaction_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        TimingSection::default().resolve()
    }
}

impl TimingSection {
    fn resolve(&self) -> SessionTimings {
        SessionTimings {
            accept_poll: Duration::from_millis(self.accept_poll_ms.max(1)),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            grace_period: Duration::from_secs(self.grace_period_secs),
            heartbeat_initial_delay: Duration::from_secs(self.heartbeat_initial_delay_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            permission_refresh_interval: Duration::from_secs(
                self.permission_refresh_interval_secs.max(1),
            ),
            probe_initial_delay: Duration::from_secs(self.probe_initial_delay_secs),
            probe_interval: Duration::from_secs(self.probe_interval_secs.max(1)),
            relay_dial_timeout: Duration::from_secs(self.relay_dial_timeout_secs),
            turn_transaction_timeout: Duration::from_secs(self.turn_transaction_timeout_secs),
        }
    }
}

/// Values given on the command line, each overriding the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub forward_to: Option<String>,
    pub max_connections: Option<usize>,
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied).
#[derive(Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub token: String,
    pub request_timeout: Duration,
    pub forward_to: String,
    pub max_connections: Option<usize>,
    pub timings: SessionTimings,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("api_url", &self.api_url)
            .field("forward_to", &self.forward_to)
            .field("max_connections", &self.max_connections)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl GatewayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> GatewayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> GatewayResult<Self> {
        let token = cli
            .token
            .or(file.control_plane.token)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::Config(
                    "gateway identity token is required (--token or RELAYGATE_TOKEN)".into(),
                )
            })?;

        let max_connections = cli
            .max_connections
            .unwrap_or(file.gateway.max_connections);

        Ok(Self {
            api_url: cli
                .api_url
                .unwrap_or(file.control_plane.api_url)
                .trim_end_matches('/')
                .to_string(),
            token,
            request_timeout: Duration::from_secs(file.control_plane.request_timeout_secs),
            forward_to: cli.forward_to.unwrap_or(file.gateway.forward_to),
            max_connections: (max_connections > 0).then_some(max_connections),
            timings: file.timing.resolve(),
        })
    }
}

fn parse_config(content: &str) -> GatewayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
