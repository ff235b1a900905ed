use std::env;
use std::time::Duration;

use crate::utils::{BackoffConfig, CircuitBreakerConfig, RetryConfig};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a valid {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Tuning for the outbox publish loop
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Max entries claimed per publish cycle
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Locks older than this are considered abandoned and released
    pub lock_timeout: Duration,
    /// How long acknowledged entries are kept
    pub retention: Duration,
    /// Failed entries older than this are reported
    pub failed_alert_age: Duration,
    /// How often retention GC and failed-entry reporting run
    pub gc_interval: Duration,
    pub publish_retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            failed_alert_age: Duration::from_secs(15 * 60),
            gc_interval: Duration::from_secs(60),
            publish_retry: RetryConfig::conservative(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl OutboxConfig {
    /// Fast cadence for tests and the demo binary
    pub fn fast() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(100),
            lock_timeout: Duration::from_secs(5),
            gc_interval: Duration::from_secs(1),
            publish_retry: RetryConfig::none(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeStreamConfig {
    /// Delay between re-subscription attempts
    pub backoff: BackoffConfig,
}

/// Process-level settings read from the environment
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub database_url: Option<String>,
    pub kafka_brokers: Option<String>,
    pub outbox: OutboxConfig,
    pub change_stream: ChangeStreamConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut outbox = OutboxConfig::default();

        if let Some(value) = lookup("OUTBOX_BATCH_SIZE") {
            outbox.batch_size = parse("OUTBOX_BATCH_SIZE", &value, "positive integer")?;
            if outbox.batch_size == 0 {
                return Err(ConfigError::Invalid {
                    key: "OUTBOX_BATCH_SIZE",
                    expected: "positive integer",
                    value,
                });
            }
        }
        if let Some(value) = lookup("OUTBOX_POLL_INTERVAL_MS") {
            outbox.poll_interval =
                Duration::from_millis(parse("OUTBOX_POLL_INTERVAL_MS", &value, "number of milliseconds")?);
        }
        if let Some(value) = lookup("OUTBOX_LOCK_TIMEOUT_SECS") {
            outbox.lock_timeout =
                Duration::from_secs(parse("OUTBOX_LOCK_TIMEOUT_SECS", &value, "number of seconds")?);
        }
        if let Some(value) = lookup("OUTBOX_RETENTION_HOURS") {
            let hours: u64 = parse("OUTBOX_RETENTION_HOURS", &value, "number of hours")?;
            outbox.retention = Duration::from_secs(hours * 60 * 60);
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            kafka_brokers: lookup("KAFKA_BROKERS").filter(|v| !v.trim().is_empty()),
            outbox,
            change_stream: ChangeStreamConfig::default(),
        })
    }
}

fn parse<T: std::str::FromStr>(
    key: &'static str,
    value: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        expected,
        value: value.to_string(),
    })
}
