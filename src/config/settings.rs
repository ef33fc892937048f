//! Configuration settings for opqueue.
//!
//! Settings are loaded from `~/.opqueue/config.yaml`. Durations are stored
//! as integer milliseconds (`*_ms`) and exposed as [`Duration`] accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::queue::{RetryPolicy, RetryStrategy};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Queue behaviour.
    pub queue: QueueConfig,
    /// Log output.
    pub logging: LoggingConfig,
    /// Shell handlers used by `opqueue run`.
    pub handlers: Vec<HandlerConfig>,
}

/// What `enqueue` does when the queue is full.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Fail with `QueueFull`.
    #[default]
    Reject,
    /// Evict the oldest operation of the lowest non-empty tier.
    DropOldest,
    /// Wait until space frees up.
    Block,
}

impl std::str::FromStr for BackpressureStrategy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "reject" => Ok(Self::Reject),
            "drop_oldest" => Ok(Self::DropOldest),
            "block" => Ok(Self::Block),
            other => Err(QueueError::Parse(format!(
                "Unknown backpressure strategy: {other}"
            ))),
        }
    }
}

/// Queue manager settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Concurrent workers.
    pub max_workers: usize,
    /// Capacity before backpressure applies.
    pub max_queue_size: usize,
    /// Failed attempts allowed before dead-lettering.
    pub max_retries: u32,
    /// Delay growth between attempts.
    pub retry_strategy: RetryStrategy,
    /// Delay for the fixed strategy.
    pub fixed_retry_delay_ms: u64,
    /// Buffer operations of `batch_modules`.
    pub enable_batching: bool,
    /// Modules whose operations are batched.
    pub batch_modules: Vec<String>,
    /// Buffered operations that trigger a flush.
    pub batch_size: usize,
    /// Time between periodic flushes.
    pub batch_flush_interval_ms: u64,
    /// Window in which identical operations are dropped.
    pub deduplication_window_ms: u64,
    /// Time between dedup snapshots.
    pub persistence_interval_ms: u64,
    /// Policy when full.
    pub backpressure_strategy: BackpressureStrategy,
    /// Consecutive failures that open a module's circuit.
    pub circuit_breaker_threshold: u32,
    /// Time an open circuit waits before a trial.
    pub circuit_breaker_timeout_ms: u64,
    /// Dispatches per second per module.
    pub rate_limit: u32,
    /// How long processed rows are kept.
    pub processed_retention_ms: u64,
    /// Time between purges of processed rows.
    pub cleanup_interval_ms: u64,
    /// Worker sleep when a module is gated by its breaker or rate limiter.
    pub backoff_ms: u64,
    /// Poll interval while `enqueue` blocks on a full queue.
    pub block_poll_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            max_queue_size: 1000,
            max_retries: 3,
            retry_strategy: RetryStrategy::Exponential,
            fixed_retry_delay_ms: 5_000,
            enable_batching: false,
            batch_modules: Vec::new(),
            batch_size: 10,
            batch_flush_interval_ms: 5_000,
            deduplication_window_ms: 5 * 60 * 1000,
            persistence_interval_ms: 30_000,
            backpressure_strategy: BackpressureStrategy::Reject,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_ms: 60_000,
            rate_limit: 10,
            processed_retention_ms: 24 * 60 * 60 * 1000,
            cleanup_interval_ms: 60 * 60 * 1000,
            backoff_ms: 100,
            block_poll_ms: 50,
        }
    }
}

impl QueueConfig {
    /// Reject settings the queue cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<(), QueueError> {
        let checks = [
            ("max_workers", self.max_workers == 0),
            ("max_queue_size", self.max_queue_size == 0),
            ("batch_size", self.batch_size == 0),
            ("rate_limit", self.rate_limit == 0),
            ("circuit_breaker_threshold", self.circuit_breaker_threshold == 0),
        ];
        for (field, is_zero) in checks {
            if is_zero {
                return Err(QueueError::Config(format!("{field} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// Retry budget and delay settings.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            strategy: self.retry_strategy,
            max_retries: self.max_retries,
            fixed_delay: Duration::from_millis(self.fixed_retry_delay_ms),
        }
    }

    /// Whether operations of `module` are batched.
    #[must_use]
    pub fn is_batched(&self, module: &str) -> bool {
        self.enable_batching && self.batch_modules.iter().any(|m| m == module)
    }

    /// See `batch_flush_interval_ms`.
    #[must_use]
    pub const fn batch_flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms)
    }

    /// See `deduplication_window_ms`.
    #[must_use]
    pub const fn deduplication_window(&self) -> Duration {
        Duration::from_millis(self.deduplication_window_ms)
    }

    /// See `persistence_interval_ms`.
    #[must_use]
    pub const fn persistence_interval(&self) -> Duration {
        Duration::from_millis(self.persistence_interval_ms)
    }

    /// See `circuit_breaker_timeout_ms`.
    #[must_use]
    pub const fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_ms)
    }

    /// See `processed_retention_ms`.
    #[must_use]
    pub const fn processed_retention(&self) -> Duration {
        Duration::from_millis(self.processed_retention_ms)
    }

    /// See `cleanup_interval_ms`.
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// See `backoff_ms`.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// See `block_poll_ms`.
    #[must_use]
    pub const fn block_poll(&self) -> Duration {
        Duration::from_millis(self.block_poll_ms)
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// A shell command executing one `(module, action)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Module name.
    pub module: String,
    /// Action name.
    pub action: String,
    /// Program to run; receives the payload JSON on stdin.
    pub command: String,
    /// Extra arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Load configuration from a specific path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load_from_path(path: &std::path::Path) -> Result<Self, QueueError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            QueueError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        serde_yaml::from_str(&contents).map_err(|e| {
            QueueError::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })
    }

    /// Save configuration to a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to_path(&self, path: &std::path::Path) -> Result<(), QueueError> {
        let contents = serde_yaml::to_string(self)
            .map_err(|e| QueueError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, contents).map_err(|e| {
            QueueError::Config(format!(
                "Failed to write config file {}: {e}",
                path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.queue.max_workers, 3);
        assert_eq!(config.queue.backpressure_strategy, BackpressureStrategy::Reject);
        assert_eq!(config.queue.deduplication_window(), Duration::from_secs(300));
        assert_eq!(config.queue.processed_retention(), Duration::from_secs(86_400));
        assert_eq!(config.logging.level, "info");
        assert!(config.handlers.is_empty());
        assert!(config.queue.validate().is_ok());
    }

    #[test]
    fn test_load_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let config = Config::load_from_path(&config_path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut config = Config::default();
        config.queue.max_retries = 5;
        config.queue.retry_strategy = RetryStrategy::Jittered;
        config.handlers.push(HandlerConfig {
            module: "lyrics".to_string(),
            action: "create_song".to_string(),
            command: "true".to_string(),
            args: Vec::new(),
        });

        config.save_to_path(&config_path).unwrap();
        let loaded = Config::load_from_path(&config_path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let partial_yaml = r"
queue:
  max_workers: 8
  backpressure_strategy: drop_oldest
  batch_modules: [sync]
";
        std::fs::write(&config_path, partial_yaml).unwrap();

        let config = Config::load_from_path(&config_path).unwrap();

        assert_eq!(config.queue.max_workers, 8);
        assert_eq!(config.queue.backpressure_strategy, BackpressureStrategy::DropOldest);
        assert_eq!(config.queue.max_queue_size, 1000);
        assert!(!config.queue.is_batched("sync"));
    }

    #[test]
    fn test_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "queue: [not, a, map]").unwrap();

        assert!(matches!(
            Config::load_from_path(&config_path),
            Err(QueueError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut queue = QueueConfig {
            max_workers: 0,
            ..QueueConfig::default()
        };
        let err = queue.validate().unwrap_err();
        assert!(err.to_string().contains("max_workers"));

        queue.max_workers = 1;
        queue.rate_limit = 0;
        assert!(queue.validate().is_err());
    }

    #[test]
    fn test_retry_policy_and_batching() {
        let queue = QueueConfig {
            max_retries: 2,
            enable_batching: true,
            batch_modules: vec!["sync".to_string()],
            ..QueueConfig::default()
        };
        assert_eq!(queue.retry_policy().max_retries, 2);
        assert!(queue.is_batched("sync"));
        assert!(!queue.is_batched("lyrics"));
        assert_eq!("drop-oldest".parse::<BackpressureStrategy>().unwrap(), BackpressureStrategy::DropOldest);
    }
}
