//! Reconciler configuration
//!
//! Loaded from YAML. Every field has a default; the defaults are the
//! observable contract (terminal stage 6, re-check every 3000 ms, terminal
//! signal 2000 ms after `Ready`).

use crate::project::{RECHECK_INTERVAL_MS, TERMINAL_DELAY_MS, TERMINAL_STAGE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Change feed observation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Listen for stage updates at all. When false the session only polls.
    pub enabled: bool,
    /// Resubscribe after a failed or dropped subscription.
    pub reconnect: bool,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect: true,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
        }
    }
}

impl FeedConfig {
    /// Backoff before the `attempt`-th consecutive reconnect (1-based).
    ///
    /// Doubles per attempt starting at `reconnect_initial_ms`, capped at
    /// `reconnect_max_ms`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .reconnect_initial_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_max_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub feed_poll_interval_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            feed_poll_interval_ms: 500,
        }
    }
}

impl SqliteConfig {
    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.feed_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub terminal_stage: u32,
    pub recheck_interval_ms: u64,
    pub terminal_delay_ms: u64,
    /// Upper bound on each point query
    pub query_timeout_ms: u64,
    pub feed: FeedConfig,
    pub sqlite: SqliteConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            terminal_stage: TERMINAL_STAGE,
            recheck_interval_ms: RECHECK_INTERVAL_MS,
            terminal_delay_ms: TERMINAL_DELAY_MS,
            query_timeout_ms: 5000,
            feed: FeedConfig::default(),
            sqlite: SqliteConfig::default(),
        }
    }
}

impl ReconcilerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_yaml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recheck_interval_ms == 0 {
            return Err(ConfigError::Invalid("recheck_interval_ms must be > 0".into()));
        }
        if self.query_timeout_ms == 0 {
            return Err(ConfigError::Invalid("query_timeout_ms must be > 0".into()));
        }
        if self.sqlite.feed_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sqlite.feed_poll_interval_ms must be > 0".into(),
            ));
        }
        if self.feed.reconnect && self.feed.reconnect_initial_ms == 0 {
            return Err(ConfigError::Invalid(
                "feed.reconnect_initial_ms must be > 0".into(),
            ));
        }
        if self.feed.reconnect_max_ms < self.feed.reconnect_initial_ms {
            return Err(ConfigError::Invalid(format!(
                "feed.reconnect_max_ms ({}) is below feed.reconnect_initial_ms ({})",
                self.feed.reconnect_max_ms, self.feed.reconnect_initial_ms
            )));
        }
        Ok(())
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }

    pub fn terminal_delay(&self) -> Duration {
        Duration::from_millis(self.terminal_delay_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}
