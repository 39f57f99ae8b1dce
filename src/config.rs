//! Configuration management for Kestrel
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{KestrelError, Result};
use crate::storage::RetryPolicy;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for Kestrel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Conversation database settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Fetch/search cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Turn engine and lifecycle settings
    #[serde(default)]
    pub turn: TurnConfig,
    /// Logging output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
///
/// Controls where the conversation database lives and how write contention
/// is absorbed (engine busy timeout plus the application retry loop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How long SQLite itself waits on a lock before reporting busy (ms)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Total attempts made for one write when the database is busy
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Linear backoff step between busy retries (ms)
    #[serde(default = "default_retry_step_ms")]
    pub retry_step_ms: u64,

    /// Ceiling for the backoff delay (ms)
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,

    /// Number of pending batches the write-behind queue holds
    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,

    /// How long shutdown waits for the write-behind queue to drain (ms)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    ProjectDirs::from("dev", "kestrel", "kestrel")
        .map(|dirs| dirs.data_dir().join("kestrel.db"))
        .unwrap_or_else(|| PathBuf::from(".kestrel").join("kestrel.db"))
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_step_ms() -> u64 {
    50
}

fn default_retry_cap_ms() -> u64 {
    500
}

fn default_write_queue_capacity() -> usize {
    64
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_step_ms: default_retry_step_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            write_queue_capacity: default_write_queue_capacity(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl StorageConfig {
    /// Busy-retry policy derived from this configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_step_ms),
            Duration::from_millis(self.retry_cap_ms),
        )
    }

    /// Engine-level busy timeout
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Bounded wait used when draining the write-behind queue on shutdown
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Web fetch/search result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Disable to hand out a no-op cache handle
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Time-to-live for fetched URL results (seconds)
    #[serde(default = "default_fetch_ttl_secs")]
    pub fetch_ttl_secs: u64,

    /// Time-to-live for search query results (seconds)
    #[serde(default = "default_search_ttl_secs")]
    pub search_ttl_secs: u64,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_fetch_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_search_ttl_secs() -> u64 {
    60 * 60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            fetch_ttl_secs: default_fetch_ttl_secs(),
            search_ttl_secs: default_search_ttl_secs(),
        }
    }
}

/// Turn engine and lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Capacity of the per-turn event queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Number of turns kept on screen (and therefore undoable)
    #[serde(default = "default_display_retention")]
    pub display_retention: usize,

    /// Maximum model round-trips within one turn
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_event_queue_capacity() -> usize {
    256
}

fn default_display_retention() -> usize {
    50
}

fn default_max_steps() -> usize {
    50
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: default_event_queue_capacity(),
            display_retention: default_display_retention(),
            max_steps: default_max_steps(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json_format: bool,

    /// Optional file that receives a copy of every log line
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "kestrel=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| KestrelError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| KestrelError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(db_path) = std::env::var("KESTREL_DB_PATH") {
            self.storage.db_path = PathBuf::from(db_path);
        }

        if let Ok(ttl) = std::env::var("KESTREL_FETCH_TTL_SECS") {
            match ttl.parse() {
                Ok(value) => self.cache.fetch_ttl_secs = value,
                Err(_) => tracing::warn!("Invalid KESTREL_FETCH_TTL_SECS: {}", ttl),
            }
        }

        if let Ok(ttl) = std::env::var("KESTREL_SEARCH_TTL_SECS") {
            match ttl.parse() {
                Ok(value) => self.cache.search_ttl_secs = value,
                Err(_) => tracing::warn!("Invalid KESTREL_SEARCH_TTL_SECS: {}", ttl),
            }
        }

        if let Ok(capacity) = std::env::var("KESTREL_WRITE_QUEUE_CAPACITY") {
            match capacity.parse() {
                Ok(value) => self.storage.write_queue_capacity = value,
                Err(_) => tracing::warn!("Invalid KESTREL_WRITE_QUEUE_CAPACITY: {}", capacity),
            }
        }

        if let Ok(level) = std::env::var("KESTREL_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(db_path) = &cli.db_path {
            self.storage.db_path = db_path.clone();
        }
        if cli.verbose {
            self.logging.level = "kestrel=debug".to_string();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.storage.retry_attempts == 0 {
            return Err(KestrelError::Config(
                "storage.retry_attempts must be greater than 0".to_string(),
            )
            .into());
        }

        if self.storage.retry_step_ms > self.storage.retry_cap_ms {
            return Err(KestrelError::Config(format!(
                "storage.retry_step_ms ({}) must not exceed storage.retry_cap_ms ({})",
                self.storage.retry_step_ms, self.storage.retry_cap_ms
            ))
            .into());
        }

        if self.storage.write_queue_capacity == 0 {
            return Err(KestrelError::Config(
                "storage.write_queue_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        if self.turn.event_queue_capacity == 0 {
            return Err(KestrelError::Config(
                "turn.event_queue_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        if self.turn.display_retention == 0 {
            return Err(KestrelError::Config(
                "turn.display_retention must be greater than 0".to_string(),
            )
            .into());
        }

        if self.turn.max_steps == 0 {
            return Err(
                KestrelError::Config("turn.max_steps must be greater than 0".to_string()).into(),
            );
        }

        Ok(())
    }
}
