//! Persistence sinks: where committed batches go.
//!
//! A sink receives a whole batch and applies it as one transaction. Upserts
//! merge by [`RecordKey`]; within a batch the last write for a key wins (see
//! [`coalesce`]). A sink either commits everything or reports a
//! [`CommitError`], in which case the queue treats the whole batch as lost.

use crate::error::CommitError;
use crate::operation::{Operation, OperationKind, Record, RecordKey};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// Durable store consumed by the write-behind worker.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Commit `batch` atomically, in order.
    async fn commit(&self, batch: &[Operation]) -> Result<(), CommitError>;
}

#[async_trait]
impl<S> PersistenceSink for Arc<S>
where
    S: PersistenceSink + ?Sized,
{
    async fn commit(&self, batch: &[Operation]) -> Result<(), CommitError> {
        (**self).commit(batch).await
    }
}

/// Collapse a batch to one record per key, keeping the last write and the
/// position of its first occurrence.
pub fn coalesce(batch: &[Operation]) -> Vec<Record> {
    let mut slots: HashMap<RecordKey, usize> = HashMap::with_capacity(batch.len());
    let mut merged: Vec<Record> = Vec::with_capacity(batch.len());
    for op in batch {
        match op.kind() {
            OperationKind::Upsert(record) => match slots.get(&record.key()) {
                Some(&idx) => merged[idx] = record.clone(),
                None => {
                    slots.insert(record.key(), merged.len());
                    merged.push(record.clone());
                }
            },
        }
    }
    merged
}

#[derive(Debug, Default)]
struct MemoryState {
    table: HashMap<RecordKey, Record>,
    commits: Vec<Vec<Operation>>,
    scripted_failures: VecDeque<CommitError>,
}

/// In-memory sink: a merged table plus a log of every successful commit.
///
/// Failures can be scripted with [`fail_next`](Self::fail_next), which makes it
/// the sink of choice for tests and for running without a database.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail with `err`. Calls queue up.
    pub fn fail_next(&self, err: CommitError) {
        self.lock().scripted_failures.push_back(err);
    }

    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        self.lock().table.get(key).cloned()
    }

    /// Number of distinct records stored.
    pub fn len(&self) -> usize {
        self.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().table.is_empty()
    }

    /// Sizes of successful commits, in order.
    pub fn commit_sizes(&self) -> Vec<usize> {
        self.lock().commits.iter().map(Vec::len).collect()
    }

    /// Every committed operation, flattened in commit order.
    pub fn committed(&self) -> Vec<Operation> {
        self.lock().commits.iter().flatten().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PersistenceSink for MemoryStore {
    async fn commit(&self, batch: &[Operation]) -> Result<(), CommitError> {
        let mut state = self.lock();
        if let Some(err) = state.scripted_failures.pop_front() {
            return Err(err);
        }
        for record in coalesce(batch) {
            state.table.insert(record.key(), record);
        }
        state.commits.push(batch.to_vec());
        Ok(())
    }
}
