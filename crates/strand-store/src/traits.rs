use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use strand_stream::StreamReader;
use strand_types::{Fragment, Query, RecordId};

use crate::error::StoreResult;

/// Storage driver for per-record delta logs and checkpoints.
///
/// All implementations must satisfy these invariants:
/// - `open` creates the record on first use; a created record is visible to
///   `query` even before its first write.
/// - Delta bytes are appended in write order and never reordered.
/// - A checkpoint in a write reflects the record state *after* that write's
///   deltas, so `read` returns only the deltas appended after it.
/// - The backend never interprets delta or checkpoint bytes. Only query
///   deltas are decoded, to maintain the projection `query` filters on.
/// - All I/O errors are propagated, never silently ignored. Retrying is the
///   caller's decision.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Get the record stored under `key`, creating it if absent.
    async fn open(&self, table: &str, key: &RecordId) -> StoreResult<Arc<dyn RecordHandle>>;

    /// Iterate a table's records in key order, optionally filtered by their
    /// current projection. Logically deleted records are skipped.
    async fn query(&self, table: &str, query: Option<&Query>) -> StoreResult<Box<dyn RecordCursor>>;

    /// Wait for every in-flight write to land.
    async fn flush(&self) -> StoreResult<()>;

    /// Flush and refuse further operations.
    async fn close(&self) -> StoreResult<()>;

    /// Drop delta bytes superseded by checkpoints. Returns the number of
    /// bytes reclaimed.
    async fn compact(&self) -> StoreResult<u64>;

    async fn stats(&self) -> StoreResult<BackendStats>;
}

/// One stored record.
#[async_trait]
pub trait RecordHandle: Send + Sync {
    fn key(&self) -> &RecordId;

    fn table(&self) -> &str;

    /// Current query projection.
    async fn query(&self) -> StoreResult<Fragment>;

    /// Latest checkpoint plus every delta chunk appended after it.
    async fn read(&self) -> StoreResult<StoredRecord>;

    /// Append deltas, update the projection, and replace the checkpoint, as
    /// one write.
    async fn write(&self, write: RecordWrite) -> StoreResult<()>;
}

/// Async iterator over record handles. Dropping a cursor releases it;
/// `close` does so explicitly and makes further `next` calls fail.
#[async_trait]
pub trait RecordCursor: Send {
    async fn next(&mut self) -> StoreResult<Option<Arc<dyn RecordHandle>>>;

    async fn close(&mut self) -> StoreResult<()>;
}

/// What `RecordHandle::read` returns.
pub struct StoredRecord {
    pub checkpoint: Option<Bytes>,
    /// Delta log bytes after the checkpoint, chunked as they were written.
    pub deltas: StreamReader,
}

impl std::fmt::Debug for StoredRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredRecord")
            .field("checkpoint_len", &self.checkpoint.as_ref().map(Bytes::len))
            .field("deltas", &self.deltas)
            .finish()
    }
}

/// One write to a record. Every part is optional; an empty write is a no-op.
#[derive(Debug, Clone, Default)]
pub struct RecordWrite {
    /// Encoded delta batch over the query projection.
    pub query_delta: Option<Bytes>,
    /// Bytes appended to the delta log.
    pub delta_bytes: Option<Bytes>,
    /// Full snapshot replacing the current checkpoint.
    pub checkpoint_bytes: Option<Bytes>,
}

impl RecordWrite {
    pub fn is_empty(&self) -> bool {
        self.query_delta.is_none() && self.delta_bytes.is_none() && self.checkpoint_bytes.is_none()
    }
}

/// Counters reported by `Backend::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub tables: usize,
    pub records: usize,
    pub reads: u64,
    pub writes: u64,
    pub checkpoints: u64,
    /// Delta log bytes currently retained.
    pub delta_bytes: u64,
    /// Checkpoint bytes currently retained.
    pub checkpoint_bytes: u64,
}
