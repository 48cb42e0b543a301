#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Holdfast
//!
//! Two small reliability components for async services:
//!
//! - **Write-behind queue**: callers submit mutations and return immediately;
//!   a background worker commits them to a [`PersistenceSink`] in ordered
//!   batches, triggered by size or by a timer.
//! - **Admission guard**: per-client failure tracking with temporary blocks,
//!   a bounded blocklist, and a tower layer that rejects blocked clients.
//!
//! ## Quick Start
//!
//! ```rust
//! use holdfast::{MemoryStore, Operation, WriteBehindConfig, WriteBehindQueue};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!     let queue = WriteBehindQueue::new(store.clone(), WriteBehindConfig::default());
//!     queue.start().unwrap();
//!
//!     queue.submit(Operation::upsert_code(7, Some("fn main() {}".into()))).unwrap();
//!
//!     let report = queue.stop(Duration::from_secs(10)).await;
//!     assert!(report.worker_exited);
//!     assert_eq!(store.len(), 1);
//! }
//! ```
//!
//! ```rust
//! use holdfast::{AdmissionConfig, AdmissionGuard};
//!
//! let guard = AdmissionGuard::new(AdmissionConfig::default());
//! for _ in 0..5 {
//!     guard.record_failed_attempt("203.0.113.9");
//! }
//! assert!(guard.is_blocked("203.0.113.9"));
//! ```

pub mod adaptive;
pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod operation;
pub mod sink;
pub mod telemetry;
pub mod write_behind;

pub use adaptive::DynamicConfig;
pub use admission::{
    AdmissionGuard, AdmissionLayer, AdmissionService, AttemptOutcome, BlockInfo, BlockListing,
    CleanupReport, ClientKey, ClientStatus,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AdmissionConfig, Settings, WriteBehindConfig};
pub use error::{AdmissionError, CommitError, ConfigError, StartError, SubmitError};
pub use operation::{Code, Operation, OperationKind, Record, RecordKey, Table, User};
pub use sink::{coalesce, MemoryStore, PersistenceSink};
pub use telemetry::{
    LogSink, MemorySink, NonBlockingSink, NullSink, TelemetrySink, WriteBehindEvent,
};
pub use write_behind::{FlushOutcome, ShutdownReport, WriteBehindQueue, WriteBehindStats};
