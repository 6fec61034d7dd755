//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`MIRROR_CONFIG`, or the first of `mirror.toml`,
//!   `/etc/mirror/mirror.toml`, `~/.config/mirror/mirror.toml`)
//! - Environment variables (`MIRROR_PORT`, `MIRROR_BUS__REDIS_URL`, ...),
//!   layered on top of the file

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Config file locations, searched in order.
const CONFIG_PATHS: [&str; 3] = [
    "mirror.toml",
    "/etc/mirror/mirror.toml",
    "~/.config/mirror/mirror.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Stable id of this instance on the event bus. Generated when absent.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Credential verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Cross-instance event bus.
    #[serde(default)]
    pub bus: BusConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Credential verification configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret shared with the token issuer.
    #[serde(default)]
    pub jwt_secret: String,

    /// Allowed clock skew in seconds.
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,

    /// Query parameter carrying the token in the handshake.
    #[serde(default = "default_token_param")]
    pub token_query_param: String,
}

/// Event bus backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// In-process only; a single instance.
    #[default]
    Local,
    /// Redis pub/sub shared by every instance.
    Redis,
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Backend to use.
    #[serde(default)]
    pub backend: BusBackend,

    /// Redis URL, for the `redis` backend.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Topic shared by all instances.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// First resubscribe delay in milliseconds.
    #[serde(default = "default_reconnect_min")]
    pub reconnect_min_ms: u64,

    /// Maximum resubscribe delay in milliseconds.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_leeway() -> u64 {
    0
}

fn default_token_param() -> String {
    "token".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_topic() -> String {
    callmirror_core::DEFAULT_TOPIC.to_string()
}

fn default_reconnect_min() -> u64 {
    100
}

fn default_reconnect_max() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_interval() -> u64 {
    25_000 // 25 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            instance_id: None,
            transport: TransportConfig::default(),
            auth: AuthConfig::default(),
            bus: BusConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            leeway_secs: default_leeway(),
            token_query_param: default_token_param(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("leeway_secs", &self.leeway_secs)
            .field("token_query_param", &self.token_query_param)
            .finish()
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::default(),
            redis_url: default_redis_url(),
            topic: default_topic(),
            reconnect_min_ms: default_reconnect_min(),
            reconnect_max_ms: default_reconnect_max(),
        }
    }
}

impl BusConfig {
    /// Resubscribe backoff bounds.
    #[must_use]
    pub fn reconnect_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.reconnect_min_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or the
    /// result is invalid.
    pub fn load() -> Result<Self> {
        let path = std::env::var("MIRROR_CONFIG").ok().or_else(|| {
            CONFIG_PATHS
                .iter()
                .map(|path| shellexpand::tilde(path).into_owned())
                .find(|path| Path::new(path).exists())
        });

        Self::from_sources(path.as_deref())
    }

    /// Load configuration from an optional file plus `MIRROR_*` environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result
    /// is invalid.
    pub fn from_sources(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::new(path, ::config::FileFormat::Toml).required(true),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("MIRROR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that have no usable default.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret must be set (MIRROR_AUTH__JWT_SECRET)");
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!("transport.websocket_path must start with '/'");
        }
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat.interval_ms must be positive");
        }
        if self.bus.topic.is_empty() {
            bail!("bus.topic must not be empty");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// The configured instance id, or a random one.
    ///
    /// Generated ids must differ between containers that share a pid and a
    /// start time, or each would drop the other's envelopes as its own.
    #[must_use]
    pub fn instance_id(&self) -> String {
        match &self.instance_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("mirror-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}
