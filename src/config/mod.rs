//! # Configuration Management Module
//!
//! Centralised configuration for the messaging core with defaults, validation and
//! TOML persistence.
//!
//! ## Configuration Structure
//!
//! - [`MessagingConfig`] - store retention limits and persistence debounce
//! - [`QueueConfig`] - delivery queue congestion thresholds and backoff timing
//! - [`StorageConfig`] - which durable storage backend to use and where
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshmsg::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("retention: {}", config.messaging.message_retention_limit);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [messaging]
//! enable_persistence = true
//! storage_key = "meshtastic-message-store"
//! message_retention_limit = 1000
//! store_retention_limit = 10
//! save_debounce_ms = 1000
//!
//! [queue]
//! congestion_threshold = 10
//! max_free_slots = 15
//! congestion_delay_multiplier_ms = 2000
//! normal_delay_ms = 500
//! max_backoff_ms = 10000
//!
//! [storage]
//! backend = "sled"
//! data_dir = "./data"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Every section and every field may be omitted; missing values take the defaults
//! shown above (persistence is off and the backend is `memory` unless configured).

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Persist stores through the configured storage backend.
    pub enable_persistence: bool,
    /// Storage key the whole store registry is saved under.
    pub storage_key: String,
    /// Maximum messages kept per conversation or channel.
    pub message_retention_limit: usize,
    /// Maximum number of per-device stores kept in memory.
    pub store_retention_limit: usize,
    /// Quiet period after the last mutation before the registry is written.
    pub save_debounce_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enable_persistence: false,
            storage_key: "meshtastic-message-store".to_string(),
            message_retention_limit: 1000,
            store_retention_limit: 10,
            save_debounce_ms: 1000,
        }
    }
}

impl MessagingConfig {
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }
}

/// Delivery queue pacing against the radio's reported free TX slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// At or below this many free slots the queue backs off proportionally.
    pub congestion_threshold: u32,
    /// At or below this many free slots (but above the threshold) sends are spaced by
    /// `normal_delay_ms`. Above it, sends go out immediately.
    pub max_free_slots: u32,
    /// Backoff per missing slot below `congestion_threshold + 1`.
    pub congestion_delay_multiplier_ms: u64,
    pub normal_delay_ms: u64,
    /// Upper bound on any single backoff.
    pub max_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            congestion_threshold: 10,
            max_free_slots: 15,
            congestion_delay_multiplier_ms: 2000,
            normal_delay_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sled,
    Json,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Memory => write!(f, "memory"),
            StorageBackend::Sled => write!(f, "sled"),
            StorageBackend::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values that would make retention or pacing meaningless.
    pub fn validate(&self) -> Result<()> {
        let m = &self.messaging;
        if m.message_retention_limit == 0 {
            bail!("messaging.message_retention_limit must be at least 1");
        }
        if m.store_retention_limit == 0 {
            bail!("messaging.store_retention_limit must be at least 1");
        }
        if m.save_debounce_ms == 0 {
            bail!("messaging.save_debounce_ms must be greater than 0");
        }
        if m.storage_key.trim().is_empty() {
            bail!("messaging.storage_key must not be empty");
        }
        let q = &self.queue;
        if q.congestion_threshold > q.max_free_slots {
            bail!(
                "queue.congestion_threshold ({}) must not exceed queue.max_free_slots ({})",
                q.congestion_threshold,
                q.max_free_slots
            );
        }
        if q.max_backoff_ms == 0 {
            bail!("queue.max_backoff_ms must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_radio_queue_constants() {
        let config = Config::default();
        assert_eq!(config.queue.max_free_slots, 15);
        assert_eq!(config.queue.congestion_threshold, 10);
        assert_eq!(config.queue.congestion_delay_multiplier_ms, 2000);
        assert_eq!(config.queue.max_backoff_ms, 10_000);
        assert_eq!(config.queue.normal_delay_ms, 500);
        assert_eq!(config.messaging.save_debounce(), Duration::from_secs(1));
        assert!(!config.messaging.enable_persistence);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [messaging]
            enable_persistence = true
            store_retention_limit = 2

            [storage]
            backend = "json"
            "#,
        )
        .unwrap();
        assert!(config.messaging.enable_persistence);
        assert_eq!(config.messaging.store_retention_limit, 2);
        assert_eq!(config.messaging.message_retention_limit, 1000);
        assert_eq!(config.storage.backend, StorageBackend::Json);
        assert_eq!(config.storage.data_dir, "./data");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.messaging.store_retention_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue.congestion_threshold = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.messaging.storage_key, "meshtastic-message-store");
        assert_eq!(parsed.storage.backend, StorageBackend::Memory);
    }
}
