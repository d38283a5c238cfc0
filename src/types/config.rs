//! Configuration structures.
//!
//! Configuration is loaded from JSON files; every section has defaults so a
//! partial document (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Global dispatch engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Event loop configuration.
    #[serde(default)]
    pub event_loop: EventLoopConfig,

    /// Work queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.event_loop.validate()?;
        self.queue.validate()
    }
}

/// Event loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Default worker count for callers that take it from config.
    pub workers: usize,

    /// Deadline for informer caches to report synced. `None` waits until
    /// the stop signal fires.
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Option<Duration>,

    /// How often the has-synced predicates are polled.
    #[serde(with = "humantime_serde")]
    pub sync_poll_interval: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            sync_timeout: None,
            sync_poll_interval: Duration::from_millis(100),
        }
    }
}

impl EventLoopConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::validation("event_loop.workers must be at least 1"));
        }
        if self.sync_poll_interval.is_zero() {
            return Err(Error::validation(
                "event_loop.sync_poll_interval must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Work queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueConfig {
    /// Per-item retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Optional overall rate limit applied on top of per-item backoff.
    #[serde(default)]
    pub rate_limit: Option<BucketConfig>,
}

impl QueueConfig {
    fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if let Some(bucket) = &self.rate_limit {
            bucket.validate()?;
        }
        Ok(())
    }
}

/// Exponential backoff retry policy for failed callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Requeues allowed before an item is dropped as a permanent failure.
    pub max_retries: u32,

    /// Delay before the first retry; doubles on each further failure.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for a single retry delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.base_delay > self.max_delay {
            return Err(Error::validation(format!(
                "queue.retry.base_delay ({:?}) exceeds max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// Token bucket shared by every item of a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Sustained requeues per second.
    pub qps: f64,

    /// Tokens available at once.
    pub burst: u32,
}

impl BucketConfig {
    fn validate(&self) -> Result<()> {
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Err(Error::validation("queue.rate_limit.qps must be positive"));
        }
        if self.burst == 0 {
            return Err(Error::validation("queue.rate_limit.burst must be at least 1"));
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.event_loop.workers, 2);
        assert!(config.event_loop.sync_timeout.is_none());
        assert!(config.queue.rate_limit.is_none());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = Config::from_json_str(
            r#"{
                "event_loop": { "workers": 4, "sync_timeout": "30s" },
                "queue": { "retry": { "max_retries": 2, "base_delay": "5ms" } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.event_loop.workers, 4);
        assert_eq!(config.event_loop.sync_timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            config.event_loop.sync_poll_interval,
            Duration::from_millis(100)
        );
        assert_eq!(config.queue.retry.max_retries, 2);
        assert_eq!(config.queue.retry.base_delay, Duration::from_millis(5));
        assert_eq!(config.queue.retry.max_delay, Duration::from_secs(30));
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_rate_limit_section() {
        let config = Config::from_json_str(
            r#"{ "queue": { "rate_limit": { "qps": 10.0, "burst": 100 } } }"#,
        )
        .unwrap();
        let bucket = config.queue.rate_limit.unwrap();
        assert_eq!(bucket.burst, 100);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Config::from_json_str(r#"{ "event_loop": { "workers": 0 } }"#).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let err = Config::from_json_str(
            r#"{ "queue": { "retry": { "base_delay": "10s", "max_delay": "1s" } } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds max_delay"));
    }

    #[test]
    fn test_bad_bucket_rejected() {
        let err = Config::from_json_str(
            r#"{ "queue": { "rate_limit": { "qps": 0.0, "burst": 1 } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = Config::from_json_str(
            r#"{ "queue": { "rate_limit": { "qps": 1.0, "burst": 0 } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "observability": {{ "json_logs": true }} }}"#).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(config.observability.json_logs);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::from_file("/nonexistent/kubehandler.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
