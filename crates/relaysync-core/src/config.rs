//! Sync layer configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (RELAYSYNC_*, nested keys separated by `__`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Relay URLs to connect to.
    #[serde(default)]
    pub relays: Vec<String>,

    /// Subscription manager settings.
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Feed engine settings.
    #[serde(default)]
    pub feeds: FeedConfig,
}

/// Subscription manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Cap on concurrently active subscriptions before shedding.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Activity timeout used when a caller does not pass one.
    #[serde(default = "default_subscription_timeout")]
    pub default_timeout_ms: u64,
}

/// Authentication configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// How long a queued request waits for a handshake.
    #[serde(default = "default_auth_timeout")]
    pub timeout_ms: u64,

    /// How long a persisted session is trusted after a restart.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// JSON file holding persisted auth state. In-memory when unset.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

/// Feed engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Page size when a caller does not pass one.
    #[serde(default = "default_feed_limit")]
    pub default_limit: usize,

    /// Activity timeout of a feed's live subscription.
    #[serde(default = "default_live_timeout")]
    pub live_timeout_ms: u64,

    /// How long `load_more` waits for relays before settling for the cache.
    #[serde(default = "default_page_timeout")]
    pub page_timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    64
}

fn default_subscription_timeout() -> u64 {
    10_000
}

fn default_auth_timeout() -> u64 {
    10_000
}

fn default_session_ttl() -> u64 {
    86_400 // 24 hours
}

fn default_feed_limit() -> usize {
    50
}

fn default_live_timeout() -> u64 {
    10_000
}

fn default_page_timeout() -> u64 {
    8_000
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_timeout_ms: default_subscription_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_auth_timeout(),
            session_ttl_secs: default_session_ttl(),
            state_path: None,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_limit: default_feed_limit(),
            live_timeout_ms: default_live_timeout(),
            page_timeout_ms: default_page_timeout(),
        }
    }
}

impl SubscriptionConfig {
    /// Default activity timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl AuthConfig {
    /// Handshake wait timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Persisted session lifetime.
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl FeedConfig {
    /// Live subscription activity timeout.
    #[must_use]
    pub fn live_timeout(&self) -> Duration {
        Duration::from_millis(self.live_timeout_ms)
    }

    /// Pagination wait timeout.
    #[must_use]
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }
}

const CONFIG_PATHS: [&str; 2] = ["relaysync.toml", "~/.config/relaysync/relaysync.toml"];

impl SyncConfig {
    /// Load configuration from the first config file found, with
    /// `RELAYSYNC_*` environment overrides layered on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .find(|p| p.exists());
        Self::layered(file.as_deref())
    }

    /// `file` (if any) with `RELAYSYNC_*` overrides on top.
    fn layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        let layered = builder
            .add_source(
                config::Environment::with_prefix("RELAYSYNC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("relays"),
            )
            .build()
            .context("Failed to assemble configuration")?;

        layered
            .try_deserialize()
            .context("Failed to deserialize configuration")
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

        let config: SyncConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
