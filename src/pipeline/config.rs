//! Pipeline configuration from environment variables

use std::env;
use std::time::Duration;

/// Configuration for the click pipeline
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Aggregate flush interval in milliseconds
    pub flush_interval_ms: u64,

    /// Number of counter shards (fixed for the process lifetime)
    pub shards: usize,

    /// Longest range the stats read path accepts, in days (0 = unlimited)
    pub read_max_range_days: u32,

    /// Upper bound for the shutdown drain in milliseconds
    pub shutdown_wait_ms: u64,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "data/clicks.db".to_string(),
            flush_interval_ms: 1_000,
            shards: 64,
            read_max_range_days: 90,
            shutdown_wait_ms: 5_000,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CLICKS_DB_PATH` (default: data/clicks.db)
    /// - `FLUSH_INTERVAL_MS` (default: 1000)
    /// - `SHARDS` (default: 64, must be > 0)
    /// - `READ_MAX_RANGE_DAYS` (default: 90, 0 disables the limit)
    /// - `SHUTDOWN_WAIT_MS` (default: 5000)
    ///
    /// Empty variables count as unset. Unparseable values are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            db_path: var("CLICKS_DB_PATH").unwrap_or(defaults.db_path),
            flush_interval_ms: parse_var("FLUSH_INTERVAL_MS")?
                .unwrap_or(defaults.flush_interval_ms),
            shards: parse_var("SHARDS")?.unwrap_or(defaults.shards),
            read_max_range_days: parse_var("READ_MAX_RANGE_DAYS")?
                .unwrap_or(defaults.read_max_range_days),
            shutdown_wait_ms: parse_var("SHUTDOWN_WAIT_MS")?.unwrap_or(defaults.shutdown_wait_ms),
        };

        if config.shards == 0 {
            return Err(ConfigError::InvalidValue("SHARDS must be > 0".to_string()));
        }

        Ok(config)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_wait_ms)
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{}={:?}", name, raw))),
    }
}
