//! Validated configuration for the write-behind queue and the admission guard.
//!
//! [`Settings`] is the flat, seconds-based surface an operator edits (JSON via
//! `serde_json`); it converts into the two validated config types.

use crate::error::ConfigError;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BATCH_SIZE: usize = 30;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(6000);
pub const DEFAULT_MAX_BLOCKED_IPS: usize = 1000;
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for [`WriteBehindQueue`](crate::write_behind::WriteBehindQueue).
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBehindConfig {
    batch_interval: Duration,
    batch_size: usize,
    queue_capacity: Option<usize>,
    shutdown_timeout: Duration,
}

impl WriteBehindConfig {
    /// Create a config with validation. The queue is unbounded; see
    /// [`with_queue_capacity`](Self::with_queue_capacity).
    pub fn new(batch_interval: Duration, batch_size: usize) -> Result<Self, ConfigError> {
        let cfg = Self {
            batch_interval,
            batch_size,
            queue_capacity: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Switch to bounded mode: submissions beyond `capacity` queued operations
    /// are rejected instead of growing memory without limit.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Result<Self, ConfigError> {
        self.queue_capacity = Some(capacity);
        self.validate()?;
        Ok(self)
    }

    /// Default time `stop()` waits for the worker when the caller doesn't pass one.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.batch_interval.is_zero() {
            return Err(ConfigError::ZeroBatchInterval(self.batch_interval));
        }
        if let Some(capacity) = self.queue_capacity {
            if capacity < self.batch_size {
                return Err(ConfigError::CapacityBelowBatchSize {
                    capacity,
                    batch_size: self.batch_size,
                });
            }
        }
        Ok(())
    }

    /// Time between timer-driven flushes.
    pub fn batch_interval(&self) -> Duration {
        self.batch_interval
    }

    /// Max operations per flush; also the immediate-flush threshold.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `None` means unbounded.
    pub fn queue_capacity(&self) -> Option<usize> {
        self.queue_capacity
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            batch_interval: DEFAULT_BATCH_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_capacity: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Configuration for [`AdmissionGuard`](crate::admission::AdmissionGuard).
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    max_failed_attempts: u32,
    block_duration: Duration,
    max_blocked_ips: usize,
    cleanup_interval: Duration,
}

impl AdmissionConfig {
    /// Create a config with validation. `cleanup_interval` may be zero, which
    /// sweeps on every block check.
    pub fn new(
        max_failed_attempts: u32,
        block_duration: Duration,
        max_blocked_ips: usize,
        cleanup_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if max_failed_attempts == 0 {
            return Err(ConfigError::ZeroMaxFailedAttempts);
        }
        if block_duration.is_zero() {
            return Err(ConfigError::ZeroBlockDuration(block_duration));
        }
        if max_blocked_ips == 0 {
            return Err(ConfigError::ZeroMaxBlockedIps);
        }
        Ok(Self { max_failed_attempts, block_duration, max_blocked_ips, cleanup_interval })
    }

    /// Failures (within one `block_duration` of each other) before a block.
    pub fn max_failed_attempts(&self) -> u32 {
        self.max_failed_attempts
    }

    /// Length of a block, and the window after which a failure count decays.
    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// Upper bound on blocklist size after each sweep.
    pub fn max_blocked_ips(&self) -> usize {
        self.max_blocked_ips
    }

    /// Minimum spacing between sweeps triggered by block checks.
    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            block_duration: DEFAULT_BLOCK_DURATION,
            max_blocked_ips: DEFAULT_MAX_BLOCKED_IPS,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// Operator-facing settings. Durations are in seconds; missing fields take defaults.
///
/// ```
/// let settings = holdfast::Settings::from_json_str(r#"{"batch_size": 50, "block_duration": 300}"#)
///     .unwrap();
/// let (queue, guard) = settings.into_configs().unwrap();
/// assert_eq!(queue.batch_size(), 50);
/// assert_eq!(guard.block_duration().as_secs(), 300);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub batch_interval: f64,
    pub batch_size: usize,
    pub queue_capacity: Option<usize>,
    pub shutdown_timeout: f64,
    pub max_failed_attempts: u32,
    pub block_duration: f64,
    pub max_blocked_ips: usize,
    pub cleanup_interval: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_interval: DEFAULT_BATCH_INTERVAL.as_secs_f64(),
            batch_size: DEFAULT_BATCH_SIZE,
            queue_capacity: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT.as_secs_f64(),
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            block_duration: DEFAULT_BLOCK_DURATION.as_secs_f64(),
            max_blocked_ips: DEFAULT_MAX_BLOCKED_IPS,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL.as_secs_f64(),
        }
    }
}

impl Settings {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn write_behind(&self) -> Result<WriteBehindConfig, ConfigError> {
        let mut cfg = WriteBehindConfig::new(
            seconds("batch_interval", self.batch_interval)?,
            self.batch_size,
        )?
        .with_shutdown_timeout(seconds("shutdown_timeout", self.shutdown_timeout)?);
        if let Some(capacity) = self.queue_capacity {
            cfg = cfg.with_queue_capacity(capacity)?;
        }
        Ok(cfg)
    }

    pub fn admission(&self) -> Result<AdmissionConfig, ConfigError> {
        AdmissionConfig::new(
            self.max_failed_attempts,
            seconds("block_duration", self.block_duration)?,
            self.max_blocked_ips,
            seconds("cleanup_interval", self.cleanup_interval)?,
        )
    }

    pub fn into_configs(self) -> Result<(WriteBehindConfig, AdmissionConfig), ConfigError> {
        Ok((self.write_behind()?, self.admission()?))
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidSeconds { field, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_values() {
        let wb = WriteBehindConfig::default();
        assert_eq!(wb.batch_interval(), Duration::from_millis(500));
        assert_eq!(wb.batch_size(), 30);
        assert_eq!(wb.queue_capacity(), None);
        assert_eq!(wb.shutdown_timeout(), Duration::from_secs(10));

        let adm = AdmissionConfig::default();
        assert_eq!(adm.max_failed_attempts(), 5);
        assert_eq!(adm.block_duration(), Duration::from_secs(6000));
        assert_eq!(adm.max_blocked_ips(), 1000);
        assert_eq!(adm.cleanup_interval(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = WriteBehindConfig::new(Duration::from_millis(10), 0).expect_err("invalid");
        assert_eq!(err, ConfigError::ZeroBatchSize);
    }

    #[test]
    fn rejects_zero_interval() {
        let err = WriteBehindConfig::new(Duration::ZERO, 1).expect_err("invalid");
        assert!(matches!(err, ConfigError::ZeroBatchInterval(_)));
    }

    #[test]
    fn rejects_capacity_smaller_than_batch() {
        let err = WriteBehindConfig::new(Duration::from_millis(10), 30)
            .and_then(|c| c.with_queue_capacity(10))
            .expect_err("invalid");
        assert_eq!(err, ConfigError::CapacityBelowBatchSize { capacity: 10, batch_size: 30 });
    }

    #[test]
    fn rejects_degenerate_guard_parameters() {
        let d = Duration::from_secs(1);
        assert_eq!(AdmissionConfig::new(0, d, 1, d), Err(ConfigError::ZeroMaxFailedAttempts));
        assert!(matches!(
            AdmissionConfig::new(1, Duration::ZERO, 1, d),
            Err(ConfigError::ZeroBlockDuration(_))
        ));
        assert_eq!(AdmissionConfig::new(1, d, 0, d), Err(ConfigError::ZeroMaxBlockedIps));
        assert!(AdmissionConfig::new(1, d, 1, Duration::ZERO).is_ok());
    }

    #[test]
    fn settings_fill_missing_fields_with_defaults() {
        let settings =
            Settings::from_json_str(r#"{"batch_interval": 0.25, "queue_capacity": 500}"#).unwrap();
        let (wb, adm) = settings.into_configs().unwrap();
        assert_eq!(wb.batch_interval(), Duration::from_millis(250));
        assert_eq!(wb.queue_capacity(), Some(500));
        assert_eq!(adm, AdmissionConfig::default());
    }

    #[test]
    fn settings_reject_negative_seconds_and_unknown_fields() {
        let settings = Settings { block_duration: -5.0, ..Settings::default() };
        assert!(matches!(
            settings.admission(),
            Err(ConfigError::InvalidSeconds { field: "block_duration", .. })
        ));
        assert!(matches!(
            Settings::from_json_str(r#"{"batchsize": 3}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
