//! Prometheus metrics sink for `holdfast`.
//! Bring your own `prometheus::Registry`; metrics are registered and updated
//! as write-behind events arrive.
//!
//! | metric | type | labels |
//! |---|---|---|
//! | `holdfast_write_behind_events_total` | counter | `event` |
//! | `holdfast_write_behind_operations_total` | counter | `outcome` |
//! | `holdfast_write_behind_flush_duration_seconds` | histogram | `outcome` |

use holdfast::telemetry::{TelemetrySink, WriteBehindEvent};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Flush latency buckets, in seconds. Commits are expected to land well under
/// a second; the tail catches a stalled database.
const FLUSH_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0];

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    events: IntCounterVec,
    operations: IntCounterVec,
    flush_duration: HistogramVec,
}

impl PrometheusSink {
    /// Create a sink and register its metrics into the provided registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let events = IntCounterVec::new(
            Opts::new("holdfast_write_behind_events_total", "Write-behind events"),
            &["event"],
        )?;
        let operations = IntCounterVec::new(
            Opts::new(
                "holdfast_write_behind_operations_total",
                "Operations by final outcome",
            ),
            &["outcome"],
        )?;
        let flush_duration = HistogramVec::new(
            HistogramOpts::new(
                "holdfast_write_behind_flush_duration_seconds",
                "Time spent in the persistence sink per batch",
            )
            .buckets(FLUSH_BUCKETS.to_vec()),
            &["outcome"],
        )?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        Ok(Self { registry, events, operations, flush_duration })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn observe(&self, event: &WriteBehindEvent) {
        self.events.with_label_values(&[event.label()]).inc();
        match *event {
            WriteBehindEvent::Committed { count, elapsed } => {
                self.operations.with_label_values(&["committed"]).inc_by(count as u64);
                self.flush_duration
                    .with_label_values(&["committed"])
                    .observe(elapsed.as_secs_f64());
            }
            WriteBehindEvent::Dropped { count, elapsed, .. } => {
                self.operations.with_label_values(&["dropped"]).inc_by(count as u64);
                self.flush_duration.with_label_values(&["dropped"]).observe(elapsed.as_secs_f64());
            }
            WriteBehindEvent::Rejected { .. } => {
                self.operations.with_label_values(&["rejected"]).inc();
            }
            WriteBehindEvent::WorkerFault { count } => {
                self.operations.with_label_values(&["faulted"]).inc_by(count as u64);
            }
        }
    }
}

impl tower_service::Service<WriteBehindEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: WriteBehindEvent) -> Self::Future {
        self.observe(&event);
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn flush_duration_tracks_commits_and_drops_only() {
        let sink = PrometheusSink::new(Registry::new()).unwrap();
        sink.observe(&WriteBehindEvent::Committed { count: 3, elapsed: Duration::from_millis(20) });
        sink.observe(&WriteBehindEvent::Committed { count: 1, elapsed: Duration::from_millis(5) });
        sink.observe(&WriteBehindEvent::Dropped {
            count: 2,
            elapsed: Duration::from_millis(1),
            retryable: false,
        });
        sink.observe(&WriteBehindEvent::Rejected { queued: 8, capacity: 8 });

        let committed = sink.flush_duration.with_label_values(&["committed"]);
        assert_eq!(committed.get_sample_count(), 2);
        assert!((committed.get_sample_sum() - 0.025).abs() < 1e-9);
        assert_eq!(sink.flush_duration.with_label_values(&["dropped"]).get_sample_count(), 1);
        assert_eq!(sink.operations.with_label_values(&["rejected"]).get(), 1);
        assert_eq!(sink.operations.with_label_values(&["committed"]).get(), 4);
    }
}
