//! Client configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`shopfloor.toml`, `~/.config/shopfloor/shopfloor.toml`,
//!   `/etc/shopfloor/shopfloor.toml`, first match wins)
//! - Environment variables (`SHOPFLOOR_*`, sections separated by `__`, e.g.
//!   `SHOPFLOOR_ENDPOINT__API_URL`)

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use shopfloor_core::{RetryPolicy, DEFAULT_EVENTS_PATH};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::manager::ManagerConfig;
use crate::notifications::ChannelConfig;

const CONFIG_PATHS: [&str; 3] = [
    "shopfloor.toml",
    "~/.config/shopfloor/shopfloor.toml",
    "/etc/shopfloor/shopfloor.toml",
];

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where the backend lives.
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Who is connecting.
    #[serde(default)]
    pub session: SessionConfig,

    /// Connection lifecycle tuning.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Editing presence.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Host notification channel.
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Backend location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// REST API base URL; the feed URL is derived from it.
    #[serde(default)]
    pub api_url: Option<String>,

    /// Route of the order feed.
    #[serde(default = "default_events_path")]
    pub path: String,
}

/// Session identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session token.
    #[serde(default)]
    pub token: Option<String>,

    /// Id of the logged-in user, used to hide self-presence.
    #[serde(default)]
    pub user_id: Option<i64>,
}

/// Connection lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Delay before a reconnect in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub reconnect_delay_ms: u64,

    /// Failures in a row before the connection degrades.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    /// Keep-alive ping interval in milliseconds.
    #[serde(default = "default_interval")]
    pub keepalive_interval_ms: u64,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Editing presence tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// How long an update keeps an order marked as being edited.
    #[serde(default = "default_interval")]
    pub editing_timeout_ms: u64,
}

/// Host notification channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_interval")]
    pub heartbeat_interval_ms: u64,

    /// Delay between registration attempts in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Registration attempts before giving up.
    #[serde(default = "default_max_failures")]
    pub max_attempts: u32,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_events_path() -> String {
    DEFAULT_EVENTS_PATH.to_string()
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_retry_delay() -> u64 {
    2_000 // 2 seconds
}

fn default_max_failures() -> u32 {
    3
}

fn default_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            path: default_events_path(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            reconnect_delay_ms: default_retry_delay(),
            max_consecutive_failures: default_max_failures(),
            keepalive_interval_ms: default_interval(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            editing_timeout_ms: default_interval(),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_interval(),
            retry_delay_ms: default_retry_delay(),
            max_attempts: default_max_failures(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, layered with
    /// `SHOPFLOOR_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or the environment cannot be parsed, or
    /// if a value fails [`validate`](Self::validate).
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = Self::find_file() {
            builder = builder.add_source(config::File::from(path.as_path()).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SHOPFLOOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that would stall or disable a channel.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let connection = &self.connection;
        ensure!(
            connection.connect_timeout_ms > 0,
            "connection.connect_timeout_ms must be greater than zero"
        );
        ensure!(
            connection.keepalive_interval_ms > 0,
            "connection.keepalive_interval_ms must be greater than zero"
        );
        ensure!(
            connection.max_consecutive_failures > 0,
            "connection.max_consecutive_failures must be at least 1"
        );
        ensure!(
            connection.max_message_size > 0,
            "connection.max_message_size must be greater than zero"
        );
        ensure!(
            self.presence.editing_timeout_ms > 0,
            "presence.editing_timeout_ms must be greater than zero"
        );
        ensure!(
            self.notifications.heartbeat_interval_ms > 0,
            "notifications.heartbeat_interval_ms must be greater than zero"
        );
        ensure!(
            self.notifications.max_attempts > 0,
            "notifications.max_attempts must be at least 1"
        );
        Ok(())
    }

    fn find_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Get the connection manager settings.
    #[must_use]
    pub fn manager(&self) -> ManagerConfig {
        let connection = &self.connection;
        ManagerConfig {
            path: self.endpoint.path.clone(),
            connect_timeout: Duration::from_millis(connection.connect_timeout_ms),
            keepalive_interval: Duration::from_millis(connection.keepalive_interval_ms),
            retry: RetryPolicy::new(
                connection.max_consecutive_failures,
                Duration::from_millis(connection.reconnect_delay_ms),
            ),
            max_message_size: connection.max_message_size,
        }
    }

    /// Get the notification channel settings.
    #[must_use]
    pub fn notifications(&self) -> ChannelConfig {
        let notifications = &self.notifications;
        ChannelConfig {
            heartbeat_interval: Duration::from_millis(notifications.heartbeat_interval_ms),
            retry: RetryPolicy::new(
                notifications.max_attempts,
                Duration::from_millis(notifications.retry_delay_ms),
            ),
        }
    }

    /// Get the editing presence window.
    #[must_use]
    pub fn editing_timeout(&self) -> Duration {
        Duration::from_millis(self.presence.editing_timeout_ms)
    }
}
