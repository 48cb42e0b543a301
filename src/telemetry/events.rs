use std::fmt;
use std::time::Duration;

/// Events emitted by the write-behind queue.
///
/// One event per flush outcome, plus rejections in bounded mode. Sinks can
/// log, count or forward them; the queue never waits on a slow sink beyond
/// the sink's own `poll_ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBehindEvent {
    /// A batch was durably committed.
    Committed {
        /// Operations in the batch
        count: usize,
        /// Time spent inside the sink commit
        elapsed: Duration,
    },
    /// A batch failed to commit and was discarded.
    Dropped {
        /// Operations lost
        count: usize,
        /// Time spent before the sink gave up
        elapsed: Duration,
        /// Whether the sink classified the failure as transient
        retryable: bool,
    },
    /// A submission was refused because the bounded queue was full.
    Rejected {
        /// Queue length at the time of rejection
        queued: usize,
        /// Configured capacity
        capacity: usize,
    },
    /// A flush panicked; the worker recovered and keeps running.
    WorkerFault {
        /// Operations that were in flight
        count: usize,
    },
}

impl WriteBehindEvent {
    /// Short stable label, used for metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            WriteBehindEvent::Committed { .. } => "committed",
            WriteBehindEvent::Dropped { .. } => "dropped",
            WriteBehindEvent::Rejected { .. } => "rejected",
            WriteBehindEvent::WorkerFault { .. } => "worker_fault",
        }
    }
}

impl fmt::Display for WriteBehindEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteBehindEvent::Committed { count, elapsed } => {
                write!(f, "Committed(ops={}, elapsed={:?})", count, elapsed)
            }
            WriteBehindEvent::Dropped { count, elapsed, retryable } => write!(
                f,
                "Dropped(ops={}, elapsed={:?}, retryable={})",
                count, elapsed, retryable
            ),
            WriteBehindEvent::Rejected { queued, capacity } => {
                write!(f, "Rejected({}/{})", queued, capacity)
            }
            WriteBehindEvent::WorkerFault { count } => write!(f, "WorkerFault(ops={})", count),
        }
    }
}
