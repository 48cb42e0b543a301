//! Error types for the write-behind queue, admission guard and configuration.
use std::fmt;
use std::time::Duration;

/// Failure reported by a [`PersistenceSink`](crate::sink::PersistenceSink) commit.
///
/// Both variants currently cause the batch to be dropped; the split exists so a
/// retrying policy can be layered on without changing sink implementations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// Transient failure (lock timeout, connection reset). A retry might succeed.
    #[error("retryable commit failure: {0}")]
    Retryable(String),
    /// Permanent failure (constraint violation, corrupt payload).
    #[error("terminal commit failure: {0}")]
    Terminal(String),
}

impl CommitError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    /// Check if a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Rejection from [`WriteBehindQueue::submit`](crate::write_behind::WriteBehindQueue::submit).
///
/// Only produced when a queue capacity is configured; the default unbounded
/// queue accepts everything.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("write queue full ({queued} queued, capacity {capacity})")]
    QueueFull { queued: usize, capacity: usize },
}

/// Failure to launch the background worker.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("no tokio runtime available to spawn the write-behind worker")]
    NoRuntime,
}

/// Errors produced when validating configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("batch_size must be > 0")]
    ZeroBatchSize,
    #[error("batch_interval must be > 0 (got {0:?})")]
    ZeroBatchInterval(Duration),
    #[error("queue_capacity ({capacity}) must be >= batch_size ({batch_size})")]
    CapacityBelowBatchSize { capacity: usize, batch_size: usize },
    #[error("max_failed_attempts must be > 0")]
    ZeroMaxFailedAttempts,
    #[error("block_duration must be > 0 (got {0:?})")]
    ZeroBlockDuration(Duration),
    #[error("max_blocked_ips must be > 0")]
    ZeroMaxBlockedIps,
    #[error("{field} must be a finite, non-negative number of seconds (got {value})")]
    InvalidSeconds { field: &'static str, value: f64 },
    #[error("malformed settings: {0}")]
    Parse(String),
}

/// Error returned by [`AdmissionService`](crate::admission::AdmissionService).
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The caller is on the blocklist; requests are refused until it expires.
    Blocked { key: String, remaining_seconds: u64 },
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked { remaining_seconds, .. } => {
                write!(f, "Please retry after {}s", remaining_seconds)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Blocked { .. } => None,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if this error is a blocklist rejection.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// Seconds until the caller may retry, for `Retry-After` style responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Blocked { remaining_seconds, .. } => {
                Some(Duration::from_secs(*remaining_seconds))
            }
            Self::Inner(_) => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Blocked { .. } => None,
        }
    }
}
