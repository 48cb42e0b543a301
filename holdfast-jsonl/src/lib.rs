//! JSON-lines persistence sink for `holdfast`.
//!
//! Each committed batch is coalesced by record key and appended as one line
//! per record, then synced to disk before the commit reports success. The
//! file is the log; [`JsonlStore::load`] replays it into the merged view.
//! Bring your own path.
//!
//! A batch lands whole or not at all. If any step after the file is opened
//! fails, the file is truncated back to its length before the write. A line
//! left without its newline by a crash is ignored by `load` and cut off by the
//! next append.

use async_trait::async_trait;
use holdfast::sink::{coalesce, PersistenceSink};
use holdfast::{CommitError, Operation, OperationKind, Record, RecordKey};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Errors from reading or writing the log file.
#[derive(thiserror::Error, Debug)]
pub enum JsonlError {
    #[error("jsonl io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed entry on line {line}: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl From<JsonlError> for CommitError {
    fn from(err: JsonlError) -> Self {
        match &err {
            JsonlError::Io(io_err) if is_transient(io_err) => CommitError::retryable(err.to_string()),
            _ => CommitError::terminal(err.to_string()),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Append-only file sink. Clones write to the same file and share one writer lock.
#[derive(Clone, Debug)]
pub struct JsonlStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonlStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into(), write_lock: Arc::new(Mutex::new(())) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encode and append `batch`, then `sync_data`. One write per batch.
    pub async fn append(&self, batch: &[Operation]) -> Result<usize, JsonlError> {
        let records = coalesce(batch);
        if records.is_empty() {
            return Ok(0);
        }
        let mut buf = Vec::with_capacity(records.len() * 64);
        for record in &records {
            serde_json::to_writer(&mut buf, &OperationKind::Upsert(record.clone()))
                .map_err(JsonlError::Encode)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;
        let original_len = self.repair_tail(&mut file).await?;
        if let Err(err) = write_synced(&mut file, &buf).await {
            rollback(&mut file, original_len, &self.path).await;
            return Err(err.into());
        }
        Ok(records.len())
    }

    /// Cut off a trailing line that never got its newline and return the
    /// length of the intact prefix.
    async fn repair_tail(&self, file: &mut File) -> Result<u64, JsonlError> {
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(0);
        }
        let mut last = [0u8; 1];
        file.seek(io::SeekFrom::Start(len - 1)).await?;
        file.read_exact(&mut last).await?;
        if last[0] == b'\n' {
            return Ok(len);
        }

        let mut contents = Vec::with_capacity(len as usize);
        file.seek(io::SeekFrom::Start(0)).await?;
        file.read_to_end(&mut contents).await?;
        let intact = contents.iter().rposition(|&b| b == b'\n').map_or(0, |idx| idx as u64 + 1);
        file.set_len(intact).await?;
        tracing::warn!(
            target: "holdfast::jsonl",
            path = %self.path.display(),
            discarded_bytes = len - intact,
            "truncated unterminated trailing line"
        );
        Ok(intact)
    }

    /// Replay the log into one record per key, last write winning.
    ///
    /// A missing file is an empty store. Blank lines are skipped, and so is a
    /// final line without a trailing newline.
    pub async fn load(&self) -> Result<HashMap<RecordKey, Record>, JsonlError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => return Err(err.into()),
        };
        let complete = match contents.rfind('\n') {
            Some(idx) => &contents[..=idx],
            None => "",
        };
        if complete.len() < contents.len() {
            tracing::warn!(
                target: "holdfast::jsonl",
                path = %self.path.display(),
                "ignoring unterminated trailing line"
            );
        }

        let mut merged = HashMap::new();
        for (idx, line) in complete.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let kind: OperationKind = serde_json::from_str(line)
                .map_err(|source| JsonlError::Decode { line: idx + 1, source })?;
            match kind {
                OperationKind::Upsert(record) => {
                    merged.insert(record.key(), record);
                }
            }
        }
        Ok(merged)
    }
}

async fn write_synced(file: &mut File, buf: &[u8]) -> io::Result<()> {
    file.write_all(buf).await?;
    file.flush().await?;
    file.sync_data().await
}

/// Drop whatever part of a failed batch reached the file.
async fn rollback(file: &mut File, original_len: u64, path: &Path) {
    if let Err(err) = file.set_len(original_len).await {
        tracing::error!(
            target: "holdfast::jsonl",
            path = %path.display(),
            original_len,
            error = %err,
            "failed to roll back partial append"
        );
    }
}

#[async_trait]
impl PersistenceSink for JsonlStore {
    async fn commit(&self, batch: &[Operation]) -> Result<(), CommitError> {
        match self.append(batch).await {
            Ok(written) => {
                tracing::trace!(
                    target: "holdfast::jsonl",
                    path = %self.path.display(),
                    ops = batch.len(),
                    written,
                    "batch appended"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    target: "holdfast::jsonl",
                    path = %self.path.display(),
                    error = %err,
                    "batch append failed"
                );
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_by_kind() {
        let transient = JsonlError::Io(io::Error::new(io::ErrorKind::Interrupted, "eintr"));
        assert!(CommitError::from(transient).is_retryable());

        let fatal = JsonlError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "ro"));
        assert!(!CommitError::from(fatal).is_retryable());
    }

    fn line(id: i64) -> Vec<u8> {
        let op = Operation::upsert(holdfast::Code { id, content: None, updated_at: None });
        let mut buf = serde_json::to_vec(op.kind()).unwrap();
        buf.push(b'\n');
        buf
    }

    #[tokio::test]
    async fn rollback_removes_a_partially_written_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollback.jsonl");
        std::fs::write(&path, line(1)).unwrap();
        let store = JsonlStore::new(&path);

        let mut file =
            tokio::fs::OpenOptions::new().read(true).append(true).open(&path).await.unwrap();
        let original_len = store.repair_tail(&mut file).await.unwrap();
        // a batch that made it to the file before sync_data failed
        write_synced(&mut file, &line(2)).await.unwrap();
        file.write_all(b"{\"op\":\"ups").await.unwrap();
        rollback(&mut file, original_len, &path).await;
        drop(file);

        assert_eq!(std::fs::read(&path).unwrap(), line(1));
        let merged = store.load().await.unwrap();
        assert_eq!(merged.len(), 1);
        assert!(merged.contains_key(&RecordKey { table: holdfast::Table::Codes, id: 1 }));
    }

    #[tokio::test]
    async fn repair_tail_keeps_only_terminated_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.jsonl");
        let mut contents = line(1);
        contents.extend_from_slice(b"{\"op\":\"upsert\",\"record\":{\"table\":\"co");
        std::fs::write(&path, &contents).unwrap();
        let store = JsonlStore::new(&path);

        let mut file =
            tokio::fs::OpenOptions::new().read(true).append(true).open(&path).await.unwrap();
        assert_eq!(store.repair_tail(&mut file).await.unwrap(), line(1).len() as u64);
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), line(1));
    }
}
