//! Write-behind batching queue.
//!
//! Request handlers [`submit`](WriteBehindQueue::submit) operations and return
//! immediately; a single background worker drains the queue into a
//! [`PersistenceSink`] every `batch_interval`, or sooner once `batch_size`
//! operations are waiting.
//!
//! # Delivery contract
//!
//! Persistence is **at-most-once and best-effort**. A successful `submit` only
//! means the operation is buffered. If the sink rejects a batch, the whole
//! batch is logged and discarded; nothing is retried or requeued. Callers that
//! need read-your-writes must not rely on this queue.
//!
//! # Shutdown contract
//!
//! [`stop`](WriteBehindQueue::stop) signals the worker, waits up to `timeout`
//! for it to exit, then drains everything still queued with sequential flushes.
//! Anything submitted before that drain finishes is committed (or dropped on
//! sink failure, as above). Anything submitted after `stop` returns stays
//! buffered until the next `start`, `flush` or `stop`, and is lost if the
//! process exits first. A sink commit that never returns blocks `stop`
//! indefinitely; no deadline is imposed on the final drain.
//!
//! # Memory
//!
//! The queue is unbounded unless [`WriteBehindConfig::with_queue_capacity`] is
//! set. Under sustained overload an unbounded queue grows without limit.

use crate::config::WriteBehindConfig;
use crate::error::{CommitError, StartError, SubmitError};
use crate::operation::Operation;
use crate::sink::PersistenceSink;
use crate::telemetry::{emit_best_effort, NullSink, TelemetrySink, WriteBehindEvent};
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of a single flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued.
    Idle,
    /// The batch was committed.
    Committed { count: usize },
    /// The sink failed; the batch was discarded.
    Dropped { count: usize, error: CommitError },
}

/// What `stop` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// False if the worker was still running when the timeout elapsed.
    pub worker_exited: bool,
    /// Flushes the final drain needed (zero if the queue was already empty).
    pub drained_batches: usize,
}

/// Counter snapshot, see [`WriteBehindQueue::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteBehindStats {
    pub submitted: u64,
    pub rejected: u64,
    pub committed: u64,
    pub dropped: u64,
    pub batches_committed: u64,
    pub batches_dropped: u64,
    pub worker_faults: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    committed: AtomicU64,
    dropped: AtomicU64,
    batches_committed: AtomicU64,
    batches_dropped: AtomicU64,
    worker_faults: AtomicU64,
}

struct Worker {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Shared<S, T> {
    config: WriteBehindConfig,
    queue: Mutex<VecDeque<Operation>>,
    flush_now: Notify,
    // Held across dequeue + commit so the sink sees one writer and FIFO order.
    flush_lock: tokio::sync::Mutex<()>,
    worker: Mutex<Option<Worker>>,
    counters: Counters,
    sink: S,
    telemetry: T,
}

/// Handle to a write-behind queue. Clones share the same queue and worker.
pub struct WriteBehindQueue<S, T = NullSink> {
    shared: Arc<Shared<S, T>>,
}

impl<S, T> Clone for WriteBehindQueue<S, T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<S, T> std::fmt::Debug for WriteBehindQueue<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBehindQueue")
            .field("config", &self.shared.config)
            .field("queued", &self.shared.lock_queue().len())
            .finish()
    }
}

impl<S> WriteBehindQueue<S, NullSink>
where
    S: PersistenceSink + 'static,
{
    /// Create a stopped queue in front of `sink`. Call [`start`](Self::start) to
    /// launch the worker.
    pub fn new(sink: S, config: WriteBehindConfig) -> Self {
        Self::with_telemetry(sink, config, NullSink)
    }
}

impl<S, T> WriteBehindQueue<S, T>
where
    S: PersistenceSink + 'static,
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
{
    /// Create a stopped queue that reports flush outcomes to `telemetry`.
    pub fn with_telemetry(sink: S, config: WriteBehindConfig, telemetry: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(VecDeque::new()),
                flush_now: Notify::new(),
                flush_lock: tokio::sync::Mutex::new(()),
                worker: Mutex::new(None),
                counters: Counters::default(),
                sink,
                telemetry,
            }),
        }
    }

    /// Append `op` to the queue. Never blocks and never waits for persistence.
    ///
    /// Once `batch_size` operations are waiting the worker is woken early.
    /// Returns `Err` only in bounded mode when the queue is full.
    pub fn submit(&self, op: Operation) -> Result<(), SubmitError> {
        let shared = &self.shared;
        let queued = {
            let mut queue = shared.lock_queue();
            if let Some(capacity) = shared.config.queue_capacity() {
                if queue.len() >= capacity {
                    let queued = queue.len();
                    drop(queue);
                    shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "holdfast::write_behind",
                        queued,
                        capacity,
                        "write queue full; rejecting submission"
                    );
                    shared.emit_detached(WriteBehindEvent::Rejected { queued, capacity });
                    return Err(SubmitError::QueueFull { queued, capacity });
                }
            }
            queue.push_back(op);
            queue.len()
        };
        shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        if queued >= shared.config.batch_size() {
            shared.flush_now.notify_one();
        }
        Ok(())
    }

    /// Spawn the background worker on the current tokio runtime. No-op if it is
    /// already running.
    pub fn start(&self) -> Result<(), StartError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StartError::NoRuntime)?;
        let mut slot = self.shared.lock_worker();
        if slot.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Ok(());
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = runtime.spawn(run_worker(self.shared.clone(), stop_rx));
        *slot = Some(Worker { stop_tx, handle });
        info!(
            target: "holdfast::write_behind",
            batch_interval_ms = self.shared.config.batch_interval().as_millis() as u64,
            batch_size = self.shared.config.batch_size(),
            "write-behind worker started"
        );
        Ok(())
    }

    /// Stop the worker and drain the queue; see the module docs for the exact
    /// contract. Safe to call repeatedly or when never started.
    pub async fn stop(&self, timeout: Duration) -> ShutdownReport {
        let worker = self.shared.lock_worker().take();
        let mut worker_exited = true;

        if let Some(Worker { stop_tx, handle }) = worker {
            let _ = stop_tx.send(());
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    error!(target: "holdfast::write_behind", error = %join_err, "write-behind worker ended abnormally");
                }
                Err(_) => {
                    worker_exited = false;
                    warn!(
                        target: "holdfast::write_behind",
                        timeout_ms = timeout.as_millis() as u64,
                        "write-behind worker did not exit in time; draining anyway"
                    );
                }
            }
        }

        let mut drained_batches = 0;
        while self.shared.guarded_flush().await.is_some() {
            drained_batches += 1;
        }
        info!(target: "holdfast::write_behind", drained_batches, "write-behind queue stopped");
        ShutdownReport { worker_exited, drained_batches }
    }

    /// [`stop`](Self::stop) with the configured `shutdown_timeout`.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.stop(self.shared.config.shutdown_timeout()).await
    }

    /// Dequeue up to `batch_size` operations and commit them as one batch.
    ///
    /// Runs on the caller's task; panics from the sink propagate. The worker
    /// uses a panic-isolating wrapper around the same logic.
    pub async fn flush(&self) -> FlushOutcome {
        self.shared.flush().await
    }

    /// Operations currently buffered.
    pub fn len(&self) -> usize {
        self.shared.lock_queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock_worker().as_ref().is_some_and(|w| !w.handle.is_finished())
    }

    pub fn config(&self) -> &WriteBehindConfig {
        &self.shared.config
    }

    pub fn sink(&self) -> &S {
        &self.shared.sink
    }

    pub fn stats(&self) -> WriteBehindStats {
        let c = &self.shared.counters;
        WriteBehindStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            committed: c.committed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            batches_committed: c.batches_committed.load(Ordering::Relaxed),
            batches_dropped: c.batches_dropped.load(Ordering::Relaxed),
            worker_faults: c.worker_faults.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker<S, T>(shared: Arc<Shared<S, T>>, mut stop_rx: oneshot::Receiver<()>)
where
    S: PersistenceSink + 'static,
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
{
    let interval = shared.config.batch_interval();
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            _ = shared.flush_now.notified() => {
                debug!(target: "holdfast::write_behind", "immediate flush requested");
            }
            _ = tokio::time::sleep(interval) => {}
        }
        shared.guarded_flush().await;
    }
    debug!(target: "holdfast::write_behind", "write-behind worker exiting");
}

impl<S, T> Shared<S, T>
where
    S: PersistenceSink + 'static,
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
{
    /// Flush with a panic boundary around the commit. Returns `None` when there
    /// was nothing to do.
    async fn guarded_flush(&self) -> Option<FlushOutcome> {
        let _serial = self.flush_lock.lock().await;
        let batch = self.dequeue_batch();
        if batch.is_empty() {
            return None;
        }
        let count = batch.len();

        match AssertUnwindSafe(self.commit_batch(batch)).catch_unwind().await {
            Ok(outcome) => Some(outcome),
            Err(payload) => {
                self.counters.worker_faults.fetch_add(1, Ordering::Relaxed);
                self.counters.dropped.fetch_add(count as u64, Ordering::Relaxed);
                error!(
                    target: "holdfast::write_behind",
                    count,
                    panic = %panic_message(&*payload),
                    "flush panicked; batch discarded, worker continues"
                );
                emit_best_effort(self.telemetry.clone(), WriteBehindEvent::WorkerFault { count })
                    .await;
                Some(FlushOutcome::Dropped {
                    count,
                    error: CommitError::terminal("sink panicked during commit"),
                })
            }
        }
    }

    async fn flush(&self) -> FlushOutcome {
        let _serial = self.flush_lock.lock().await;

        let batch = self.dequeue_batch();
        if batch.is_empty() {
            return FlushOutcome::Idle;
        }
        self.commit_batch(batch).await
    }

    /// Commit one dequeued batch and account for the result. Callers hold
    /// `flush_lock`.
    async fn commit_batch(&self, batch: Vec<Operation>) -> FlushOutcome {
        let count = batch.len();
        let started = Instant::now();
        let result = self.sink.commit(&batch).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.counters.committed.fetch_add(count as u64, Ordering::Relaxed);
                self.counters.batches_committed.fetch_add(1, Ordering::Relaxed);
                info!(
                    target: "holdfast::write_behind",
                    count,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "batch committed"
                );
                emit_best_effort(
                    self.telemetry.clone(),
                    WriteBehindEvent::Committed { count, elapsed },
                )
                .await;
                FlushOutcome::Committed { count }
            }
            Err(err) => {
                self.counters.dropped.fetch_add(count as u64, Ordering::Relaxed);
                self.counters.batches_dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: "holdfast::write_behind",
                    count,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    retryable = err.is_retryable(),
                    error = %err,
                    "batch commit failed"
                );
                warn!(target: "holdfast::write_behind", count, "discarded failed batch");
                emit_best_effort(
                    self.telemetry.clone(),
                    WriteBehindEvent::Dropped { count, elapsed, retryable: err.is_retryable() },
                )
                .await;
                FlushOutcome::Dropped { count, error: err }
            }
        }
    }

    fn dequeue_batch(&self) -> Vec<Operation> {
        let mut queue = self.lock_queue();
        let take = queue.len().min(self.config.batch_size());
        queue.drain(..take).collect()
    }

    /// Emit from a synchronous context without blocking the caller.
    fn emit_detached(&self, event: WriteBehindEvent) {
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(emit_best_effort(self.telemetry.clone(), event));
        }
    }
}

impl<S, T> Shared<S, T> {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Operation>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
