//! Server configuration.
//!
//! Configuration is assembled from:
//! - A TOML file (`parley.toml`, `/etc/parley/parley.toml` or
//!   `~/.config/parley/parley.toml`, first found wins)
//! - Environment overrides in the form `PARLEY__SECTION__KEY`
//! - `PARLEY_JWT_SECRET` and `PARLEY_DATABASE_URL` for collaborator secrets

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
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

    /// Endpoint paths.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Late-handshake configuration.
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Credential verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Message store selection.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of open WebSocket connections, handshaking or bound.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum message text length in characters.
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,

    /// Newest messages carried per inbox thread.
    #[serde(default = "default_inbox_preview")]
    pub inbox_preview: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// How long a socket without an upgrade credential may take to send
    /// its `connect` frame.
    #[serde(default = "default_handshake_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the account service.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

/// Which [`parley_core::MessageStore`] backs the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process store. History is lost on restart.
    #[default]
    Memory,
    /// Postgres via sqlx.
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Postgres connection string.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Pool size.
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
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

fn default_host() -> String {
    std::env::var("PARLEY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PARLEY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_text_length() -> usize {
    parley_core::service::DEFAULT_MAX_TEXT_LENGTH
}

fn default_inbox_preview() -> usize {
    parley_core::service::DEFAULT_INBOX_PREVIEW
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_pool_size() -> u32 {
    5
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            handshake: HandshakeConfig::default(),
            auth: AuthConfig::default(),
            storage: StorageConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            max_text_length: default_max_text_length(),
            inbox_preview: default_inbox_preview(),
        }
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

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database_url: None,
            max_connections: default_pool_size(),
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
    /// Load configuration from the first config file found, then apply
    /// environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// the result fails [`Config::validate`].
    pub fn load() -> Result<Self> {
        let mut base = None;
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                base = Some(Self::from_file(expanded.as_ref())?);
                break;
            }
        }

        let mut config = base.unwrap_or_default().with_overrides(None)?;
        config.apply_secrets(
            std::env::var("PARLEY_JWT_SECRET").ok(),
            std::env::var("PARLEY_DATABASE_URL").ok(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Layer `PARLEY__SECTION__KEY` variables over `self`.
    ///
    /// `env` replaces the process environment when given.
    fn with_overrides(self, env: Option<config::Map<String, String>>) -> Result<Self> {
        let layered = config::Config::builder()
            .add_source(config::Config::try_from(&self)?)
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to read environment overrides")?;

        layered
            .try_deserialize()
            .context("Invalid environment override")
    }

    fn apply_secrets(&mut self, jwt_secret: Option<String>, database_url: Option<String>) {
        if jwt_secret.is_some() {
            self.auth.jwt_secret = jwt_secret;
        }
        if database_url.is_some() {
            self.storage.database_url = database_url;
        }
    }

    /// Check that the collaborators the server needs are configured.
    ///
    /// # Errors
    ///
    /// Fails without a JWT secret, or with the Postgres backend selected and
    /// no database URL.
    pub fn validate(&self) -> Result<()> {
        if self.jwt_secret().is_none() {
            bail!("No JWT secret configured: set PARLEY_JWT_SECRET or auth.jwt_secret");
        }
        if self.storage.backend == StorageBackend::Postgres && self.database_url().is_none() {
            bail!("Postgres storage selected but no database URL: set PARLEY_DATABASE_URL or storage.database_url");
        }
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat.interval_ms must be positive");
        }
        if self.limits.inbox_preview == 0 {
            bail!("limits.inbox_preview must be positive");
        }
        Ok(())
    }

    /// The configured JWT secret, if non-empty.
    #[must_use]
    pub fn jwt_secret(&self) -> Option<&str> {
        self.auth
            .jwt_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }

    /// The configured database URL, if non-empty.
    #[must_use]
    pub fn database_url(&self) -> Option<&str> {
        self.storage
            .database_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
