//! Configuration types for SmithyMQ.
//!
//! The configuration is a plain value handed to every component at
//! construction time. Nothing reads it from a global.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for SmithyMQ.
///
/// # Examples
///
/// ```rust
/// use smithymq::config::{SmithyConfig, WorkersConfig};
///
/// // Use default configuration
/// let config = SmithyConfig::default();
/// assert!(config.validate().is_ok());
///
/// // Custom configuration
/// let config = SmithyConfig {
///     namespace: "shop".to_string(),
///     workers: WorkersConfig {
///         interval_ms: 500,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// assert_eq!(config.workers.interval_ms, 500);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmithyConfig {
    /// Namespace used for queues given without one
    pub namespace: String,

    /// Redis connection settings
    pub redis: RedisConfig,

    /// Audit retention of acknowledged and dead-lettered messages
    pub messages: MessagesConfig,

    /// Background worker settings
    pub workers: WorkersConfig,

    /// Consumer loop and heartbeat settings
    pub consumer: ConsumerConfig,

    /// Queue operational state settings
    pub queue_state: QueueStateConfig,

    /// WATCH/MULTI/EXEC retry settings
    pub watch: WatchConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for SmithyConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            redis: RedisConfig::default(),
            messages: MessagesConfig::default(),
            workers: WorkersConfig::default(),
            consumer: ConsumerConfig::default(),
            queue_state: QueueStateConfig::default(),
            watch: WatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    pub connection_string: String,

    /// Key prefix for Redis keys
    pub key_prefix: String,

    /// Time allowed to establish a connection (in seconds)
    pub connect_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            connection_string: "redis://localhost:6379".to_string(),
            key_prefix: "smithymq".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl RedisConfig {
    /// Configuration for the given connection string
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Retention of one terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAuditConfig {
    /// Keep messages reaching the status; when false they are deleted
    pub store: bool,

    /// Maximum number of kept messages per queue (0 = unbounded)
    pub queue_size: u64,

    /// Maximum age of kept messages in milliseconds (0 = never expires)
    pub expire_ms: u64,
}

impl Default for MessageAuditConfig {
    fn default() -> Self {
        Self {
            store: false,
            queue_size: 0,
            expire_ms: 0,
        }
    }
}

impl MessageAuditConfig {
    /// Keep messages with the given bounds.
    pub fn stored(queue_size: u64, expire_ms: u64) -> Self {
        Self {
            store: true,
            queue_size,
            expire_ms,
        }
    }
}

/// Audit retention of terminal messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesConfig {
    /// Retention of acknowledged messages
    pub acknowledged: MessageAuditConfig,

    /// Retention of dead-lettered messages
    pub dead_lettered: MessageAuditConfig,
}

/// Background worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Run the background workers in this process
    pub enabled: bool,

    /// Time between two ticks of a worker (in milliseconds)
    pub interval_ms: u64,

    /// Messages moved from delayed to scheduled per queue and tick
    pub delay_batch_size: usize,

    /// Due scheduled messages published per queue and tick
    pub scheduled_batch_size: usize,

    /// Messages moved from requeued to pending per queue and tick
    pub requeue_batch_size: usize,

    /// Consumers checked per queue and tick
    pub consumers_batch_size: usize,

    /// Maximum number of consecutive restarts for a single worker before circuit breaking
    pub max_restart_count: u32,

    /// Time to wait between worker restarts (in milliseconds)
    pub restart_delay_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            delay_batch_size: 10,
            scheduled_batch_size: 10,
            requeue_batch_size: 100,
            consumers_batch_size: 100,
            max_restart_count: 100,
            restart_delay_ms: 1000, // 1 second
        }
    }
}

impl WorkersConfig {
    /// Set the tick interval.
    pub fn with_interval(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Enable or disable the background workers.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Time between two heartbeats (in milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Lifetime of a heartbeat; a consumer is offline once it expires (in milliseconds)
    pub heartbeat_ttl_ms: u64,

    /// First backoff when a queue is empty (in milliseconds)
    pub idle_backoff_ms: u64,

    /// Upper bound of the empty queue backoff (in milliseconds)
    pub max_idle_backoff_ms: u64,

    /// Pause when the queue rate limit is exceeded (in milliseconds)
    pub rate_limit_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            heartbeat_ttl_ms: 10_000,
            idle_backoff_ms: 100,
            max_idle_backoff_ms: 5000,
            rate_limit_backoff_ms: 1000,
        }
    }
}

/// Queue operational state configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStateConfig {
    /// Transitions kept per queue
    pub history_size: usize,

    /// Messages deleted per purge batch
    pub purge_batch_size: usize,

    /// A running purge job not updated for this long is considered dead (in milliseconds)
    pub purge_job_stale_ms: u64,
}

impl Default for QueueStateConfig {
    fn default() -> Self {
        Self {
            history_size: 50,
            purge_batch_size: 100,
            purge_job_stale_ms: 60_000,
        }
    }
}

/// WATCH/MULTI/EXEC retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Attempts before giving up
    pub max_attempts: u32,

    /// Backoff after the n-th conflict is `n * backoff_base_ms`
    pub backoff_base_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert seconds to Duration
    fn secs(self) -> Duration;
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn secs(self) -> Duration {
        Duration::from_secs(self)
    }

    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

impl SmithyConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            messages: MessagesConfig {
                acknowledged: MessageAuditConfig::stored(1000, 0),
                dead_lettered: MessageAuditConfig::stored(1000, 0),
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            messages: MessagesConfig {
                acknowledged: MessageAuditConfig::default(),
                dead_lettered: MessageAuditConfig::stored(100_000, 7 * 24 * 3600 * 1000),
            },
            consumer: ConsumerConfig {
                heartbeat_ttl_ms: 30_000,
                ..Default::default()
            },
            queue_state: QueueStateConfig {
                purge_batch_size: 500,
                purge_job_stale_ms: 300_000,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_timestamps: true,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            namespace: "testing".to_string(),
            redis: RedisConfig {
                key_prefix: "smithymq-test".to_string(),
                connect_timeout_secs: 2,
                ..Default::default()
            },
            messages: MessagesConfig {
                acknowledged: MessageAuditConfig::stored(0, 0),
                dead_lettered: MessageAuditConfig::stored(0, 0),
            },
            workers: WorkersConfig {
                interval_ms: 100,
                restart_delay_ms: 10,
                max_restart_count: 3,
                ..Default::default()
            },
            consumer: ConsumerConfig {
                heartbeat_interval_ms: 100,
                heartbeat_ttl_ms: 1000,
                idle_backoff_ms: 10,
                max_idle_backoff_ms: 100,
                rate_limit_backoff_ms: 100,
            },
            queue_state: QueueStateConfig {
                purge_batch_size: 10,
                purge_job_stale_ms: 1000,
                ..Default::default()
            },
            watch: WatchConfig {
                max_attempts: 3,
                backoff_base_ms: 10,
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_timestamps: false,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if crate::queue::validate_name("namespace", &self.namespace).is_err() {
            errors.push(format!("Invalid namespace '{}'", self.namespace));
        }

        if self.redis.connection_string.is_empty() {
            errors.push("Redis connection string must not be empty".to_string());
        }

        if self.redis.key_prefix.is_empty() {
            errors.push("Redis key prefix must not be empty".to_string());
        }

        // Validate worker config
        if self.workers.interval_ms == 0 {
            errors.push("Worker interval must be greater than 0".to_string());
        }

        if self.workers.delay_batch_size == 0
            || self.workers.scheduled_batch_size == 0
            || self.workers.requeue_batch_size == 0
            || self.workers.consumers_batch_size == 0
        {
            errors.push("Worker batch sizes must be greater than 0".to_string());
        }

        // Validate consumer config
        if self.consumer.heartbeat_interval_ms == 0 {
            errors.push("Heartbeat interval must be greater than 0".to_string());
        }

        if self.consumer.heartbeat_ttl_ms <= self.consumer.heartbeat_interval_ms {
            errors.push("Heartbeat TTL must be greater than the heartbeat interval".to_string());
        }

        if self.consumer.max_idle_backoff_ms < self.consumer.idle_backoff_ms {
            errors.push(
                "Max idle backoff must be greater than or equal to idle backoff".to_string(),
            );
        }

        // Validate queue state config
        if self.queue_state.history_size == 0 {
            errors.push("State history size must be greater than 0".to_string());
        }

        if self.queue_state.purge_batch_size == 0 {
            errors.push("Purge batch size must be greater than 0".to_string());
        }

        if self.watch.max_attempts == 0 {
            errors.push("Watch max attempts must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SmithyConfig::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.workers.interval_ms, 1000);
        assert_eq!(config.workers.delay_batch_size, 10);
        assert_eq!(config.workers.requeue_batch_size, 100);
        assert_eq!(config.queue_state.history_size, 50);
        assert_eq!(config.watch.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = SmithyConfig::development();
        assert!(config.messages.acknowledged.store);
        assert!(matches!(config.logging.level, LogLevel::Debug));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_production_config() {
        let config = SmithyConfig::production();
        assert!(!config.messages.acknowledged.store);
        assert!(config.messages.dead_lettered.store);
        assert!(config.logging.json_format);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config() {
        let config = SmithyConfig::testing();
        assert_eq!(config.namespace, "testing");
        assert_eq!(config.watch.backoff_base_ms, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SmithyConfig::default();

        // Valid config
        assert!(config.validate().is_ok());

        config.namespace = "Not Valid!".to_string();
        assert!(config.validate().is_err());
        config.namespace = "default".to_string();

        config.consumer.heartbeat_ttl_ms = config.consumer.heartbeat_interval_ms;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("Heartbeat TTL")));

        config.consumer.heartbeat_ttl_ms = 10_000;
        config.workers.requeue_batch_size = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("batch sizes")));
    }

    #[test]
    fn test_builders() {
        let redis = RedisConfig::new("redis://example:6380").with_key_prefix("app");
        assert_eq!(redis.connection_string, "redis://example:6380");
        assert_eq!(redis.key_prefix, "app");

        let workers = WorkersConfig::default().with_interval(250).with_enabled(false);
        assert_eq!(workers.interval_ms, 250);
        assert!(!workers.enabled);

        let audit = MessageAuditConfig::stored(10, 500);
        assert!(audit.store);
        assert_eq!(audit.queue_size, 10);
    }

    #[test]
    fn test_config_serde() {
        let config = SmithyConfig::testing();
        let json = serde_json::to_string(&config).unwrap();
        let back: SmithyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.namespace, config.namespace);
        assert_eq!(back.workers.interval_ms, config.workers.interval_ms);
    }

    #[test]
    fn test_duration_ext() {
        assert_eq!(5u64.secs(), Duration::from_secs(5));
        assert_eq!(1500u64.millis(), Duration::from_millis(1500));
    }
}
