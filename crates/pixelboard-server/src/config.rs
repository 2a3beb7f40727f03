//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (PIXELBOARD_*, REDIS_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use pixelboard_core::{CachePolicy, CanvasGeometry, CanvasId, Dimensions, ServiceConfig, UserId};
use pixelboard_core::identity::StaticIdentity;
use pixelboard_protocol::DEFAULT_PALETTE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Storage backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Canvas geometry and edit rules.
    #[serde(default)]
    pub canvas: CanvasConfig,

    /// Identity provider.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Single process, nothing persisted.
    Memory,
    Redis,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default = "default_redis_username")]
    pub username: Option<String>,

    #[serde(default = "default_redis_password")]
    pub password: Option<String>,
}

/// Canvas configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasConfig {
    /// Default canvas width in pixels.
    #[serde(default = "default_width")]
    pub width: u16,

    /// Default canvas height in pixels.
    #[serde(default = "default_height")]
    pub height: u16,

    /// Seconds between edits by one credential on one canvas. 0 disables.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Canvases with their own dimensions.
    #[serde(default)]
    pub overrides: Vec<CanvasOverride>,
}

/// Dimensions for a single canvas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasOverride {
    pub id: u64,
    pub width: u16,
    pub height: u16,
}

/// Which identity provider to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Discord REST API: canvases are guilds.
    Discord,
    /// Fixed token table from this file.
    Static,
}

/// Identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,

    /// Base URL of the Discord API.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Seconds a caller's canvas list is cached.
    #[serde(default = "default_canvases_ttl")]
    pub canvases_ttl_secs: u64,

    /// Seconds a caller's user id is cached.
    #[serde(default = "default_user_ttl")]
    pub user_ttl_secs: u64,

    /// Seconds a rejected credential is cached.
    #[serde(default = "default_denied_ttl")]
    pub denied_ttl_secs: u64,

    /// Seconds between sweeps of expired cache entries.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Credentials for the static provider.
    #[serde(default)]
    pub tokens: Vec<StaticToken>,
}

/// One credential of the static provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub user_id: u64,
    pub canvases: Vec<u64>,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Live updates buffered per session.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
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
    std::env::var("PIXELBOARD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PIXELBOARD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_backend() -> BackendKind {
    if std::env::var("REDIS_HOST").is_ok() {
        BackendKind::Redis
    } else {
        BackendKind::Memory
    }
}

fn default_redis_host() -> String {
    std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_redis_port() -> u16 {
    std::env::var("REDIS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(6379)
}

fn default_redis_username() -> Option<String> {
    std::env::var("REDIS_USERNAME").ok()
}

fn default_redis_password() -> Option<String> {
    std::env::var("REDIS_PASSWORD").ok()
}

fn default_width() -> u16 {
    Dimensions::default().width
}

fn default_height() -> u16 {
    Dimensions::default().height
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_provider() -> ProviderKind {
    ProviderKind::Discord
}

fn default_api_base() -> String {
    "https://discord.com".to_string()
}

fn default_canvases_ttl() -> u64 {
    5 * 60
}

fn default_user_ttl() -> u64 {
    60 * 60
}

fn default_denied_ttl() -> u64 {
    60 * 60
}

fn default_purge_interval() -> u64 {
    60
}

fn default_subscriber_buffer() -> usize {
    1024
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            storage: StorageConfig::default(),
            canvas: CanvasConfig::default(),
            identity: IdentityConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis: RedisConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            username: default_redis_username(),
            password: default_redis_password(),
        }
    }
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            cooldown_secs: default_cooldown_secs(),
            overrides: Vec::new(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_base: default_api_base(),
            canvases_ttl_secs: default_canvases_ttl(),
            user_ttl_secs: default_user_ttl(),
            denied_ttl_secs: default_denied_ttl(),
            purge_interval_secs: default_purge_interval(),
            tokens: Vec::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            max_message_size: default_max_message_size(),
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

impl RedisConfig {
    /// Connection URL, with credentials when configured.
    #[must_use]
    pub fn url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (None, None) => String::new(),
            (Some(username), None) => format!("{}:@", username),
            (None, Some(password)) => format!(":{}@", password),
            (Some(username), Some(password)) => format!("{}:{}@", username, password),
        };
        format!("redis://{}{}:{}/", auth, self.host, self.port)
    }
}

impl IdentityConfig {
    #[must_use]
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            canvases_ttl: Duration::from_secs(self.canvases_ttl_secs),
            user_ttl: Duration::from_secs(self.user_ttl_secs),
            denied_ttl: Duration::from_secs(self.denied_ttl_secs),
        }
    }

    /// Build the static provider from the token table.
    ///
    /// # Errors
    ///
    /// Returns an error if a token maps to user id 0.
    pub fn static_identity(&self) -> Result<StaticIdentity> {
        self.tokens.iter().try_fold(StaticIdentity::new(), |identity, entry| {
            let user = UserId::new(entry.user_id)
                .with_context(|| {
                    format!("Static token for user {} has an invalid user id", entry.user_id)
                })?;
            Ok(identity.with_grant(
                entry.token.clone(),
                user,
                entry.canvases.iter().copied().map(CanvasId),
            ))
        })
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        // Try to load from default paths
        let config_paths = [
            "pixelboard.toml",
            "/etc/pixelboard/pixelboard.toml",
            "~/.config/pixelboard/pixelboard.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
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

    /// Canvas service settings.
    #[must_use]
    pub fn service_config(&self) -> ServiceConfig {
        let geometry = self.canvas.overrides.iter().fold(
            CanvasGeometry::uniform(Dimensions::new(self.canvas.width, self.canvas.height)),
            |geometry, o| {
                geometry.with_override(CanvasId(o.id), Dimensions::new(o.width, o.height))
            },
        );

        ServiceConfig {
            geometry,
            cooldown: Duration::from_secs(self.canvas.cooldown_secs),
            palette: DEFAULT_PALETTE.to_vec(),
            subscriber_buffer: self.limits.subscriber_buffer,
        }
    }
}
