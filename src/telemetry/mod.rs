//! Telemetry for the write-behind queue.
//!
//! Every flush outcome becomes a [`WriteBehindEvent`]. Events flow through
//! `TelemetrySink` implementations which can log, aggregate, or forward them
//! to external systems (see the `holdfast-prometheus` crate).
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<WriteBehindEvent>` for composability.

pub mod events;
pub mod sinks;

pub use events::WriteBehindEvent;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NonBlockingSink, NullSink, TelemetrySink};
