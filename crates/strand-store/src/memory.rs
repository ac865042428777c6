use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use strand_codec::{copy, decode_batch};
use strand_index::{BTree, IndexConfig, IndexKey};
use strand_stream::StreamReader;
use strand_types::{Document, Fragment, Query, RecordId};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::traits::{Backend, BackendStats, RecordCursor, RecordHandle, RecordWrite, StoredRecord};

/// In-memory backend.
///
/// Intended for tests and embedding. Each table keeps its record keys in a
/// [`BTree`] so queries iterate in key order, and each record keeps its
/// projection as a live [`Document`] updated from query deltas. Writes land
/// synchronously, so `flush` only checks that the backend is still open.
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Arc<MemoryTable>>>,
    shared: Arc<Shared>,
    index: IndexConfig,
}

#[derive(Default)]
struct Shared {
    closed: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    checkpoints: AtomicU64,
}

impl Shared {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

struct MemoryTable {
    name: Arc<str>,
    keys: RwLock<BTree>,
    records: RwLock<HashMap<IndexKey, Arc<MemoryRecord>>>,
}

struct MemoryRecord {
    key: RecordId,
    table: Arc<str>,
    state: RwLock<RecordState>,
    shared: Arc<Shared>,
}

struct RecordState {
    projection: Document,
    log: Vec<Bytes>,
    checkpoint: Option<Bytes>,
    /// Log position the checkpoint reflects; chunks before it are prunable.
    checkpoint_at: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            shared: Arc::new(Shared::default()),
            index: IndexConfig::default(),
        }
    }

    /// Backend whose table key indexes use `config`.
    pub fn with_index_config(config: IndexConfig) -> StoreResult<Self> {
        BTree::with_config(&config)?;
        Ok(Self {
            index: config,
            ..Self::new()
        })
    }

    /// Number of records across all tables.
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .expect("lock poisoned")
            .values()
            .map(|t| t.keys.read().expect("lock poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted table names.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn table(&self, name: &str) -> Option<Arc<MemoryTable>> {
        self.tables.read().expect("lock poisoned").get(name).cloned()
    }

    fn table_or_create(&self, name: &str) -> StoreResult<Arc<MemoryTable>> {
        if let Some(table) = self.table(name) {
            return Ok(table);
        }
        let mut tables = self.tables.write().expect("lock poisoned");
        if let Some(table) = tables.get(name) {
            return Ok(table.clone());
        }
        let table = Arc::new(MemoryTable {
            name: Arc::from(name),
            keys: RwLock::new(BTree::with_config(&self.index)?),
            records: RwLock::new(HashMap::new()),
        });
        tables.insert(name.to_string(), table.clone());
        debug!(table = name, "table created");
        Ok(table)
    }

    fn all_tables(&self) -> Vec<Arc<MemoryTable>> {
        self.tables
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTable {
    fn records(&self) -> Vec<Arc<MemoryRecord>> {
        self.records
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl MemoryRecord {
    fn matches(&self, query: Option<&Query>) -> bool {
        let state = self.state.read().expect("lock poisoned");
        if state.projection.is_deleted() {
            return false;
        }
        query.map_or(true, |q| q.matches(&state.projection))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open(&self, table: &str, key: &RecordId) -> StoreResult<Arc<dyn RecordHandle>> {
        self.shared.check_open()?;
        let table = self.table_or_create(table)?;
        let index_key = IndexKey::from(key.as_str());
        let mut records = table.records.write().expect("lock poisoned");
        if let Some(record) = records.get(&index_key) {
            return Ok(record.clone());
        }
        let record = Arc::new(MemoryRecord {
            key: key.clone(),
            table: table.name.clone(),
            state: RwLock::new(RecordState {
                projection: Document::new(key.clone()),
                log: Vec::new(),
                checkpoint: None,
                checkpoint_at: 0,
            }),
            shared: self.shared.clone(),
        });
        records.insert(index_key.clone(), record.clone());
        table.keys.write().expect("lock poisoned").insert(index_key);
        debug!(table = %table.name, key = %key, "record created");
        Ok(record)
    }

    async fn query(&self, table: &str, query: Option<&Query>) -> StoreResult<Box<dyn RecordCursor>> {
        self.shared.check_open()?;
        Ok(Box::new(MemoryCursor {
            table: self.table(table),
            query: query.cloned(),
            last: None,
            closed: false,
            shared: self.shared.clone(),
        }))
    }

    async fn flush(&self) -> StoreResult<()> {
        self.shared.check_open()
    }

    async fn close(&self) -> StoreResult<()> {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            info!(records = self.len(), "memory backend closed");
        }
        Ok(())
    }

    async fn compact(&self) -> StoreResult<u64> {
        self.shared.check_open()?;
        let mut reclaimed = 0u64;
        for table in self.all_tables() {
            for record in table.records() {
                let mut state = record.state.write().expect("lock poisoned");
                let at = state.checkpoint_at;
                reclaimed += state.log.drain(..at).map(|c| c.len() as u64).sum::<u64>();
                state.checkpoint_at = 0;
            }
        }
        debug!(reclaimed, "compacted delta logs");
        Ok(reclaimed)
    }

    async fn stats(&self) -> StoreResult<BackendStats> {
        let tables = self.all_tables();
        let mut stats = BackendStats {
            tables: tables.len(),
            reads: self.shared.reads.load(Ordering::Relaxed),
            writes: self.shared.writes.load(Ordering::Relaxed),
            checkpoints: self.shared.checkpoints.load(Ordering::Relaxed),
            ..BackendStats::default()
        };
        for table in tables {
            for record in table.records() {
                let state = record.state.read().expect("lock poisoned");
                stats.records += 1;
                stats.delta_bytes += state.log.iter().map(|c| c.len() as u64).sum::<u64>();
                stats.checkpoint_bytes += state.checkpoint.as_ref().map_or(0, |c| c.len() as u64);
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl RecordHandle for MemoryRecord {
    fn key(&self) -> &RecordId {
        &self.key
    }

    fn table(&self) -> &str {
        &self.table
    }

    async fn query(&self) -> StoreResult<Fragment> {
        self.shared.check_open()?;
        let state = self.state.read().expect("lock poisoned");
        Ok(copy(state.projection.graph(), &state.projection.root())?)
    }

    async fn read(&self) -> StoreResult<StoredRecord> {
        self.shared.check_open()?;
        self.shared.reads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read().expect("lock poisoned");
        let tail = state.log[state.checkpoint_at..].to_vec();
        Ok(StoredRecord {
            checkpoint: state.checkpoint.clone(),
            deltas: StreamReader::from_chunks(tail),
        })
    }

    async fn write(&self, write: RecordWrite) -> StoreResult<()> {
        self.shared.check_open()?;
        if write.is_empty() {
            return Ok(());
        }
        let query_deltas = write.query_delta.as_deref().map(decode_batch).transpose()?;

        let mut state = self.state.write().expect("lock poisoned");
        if let Some(deltas) = &query_deltas {
            state
                .projection
                .apply_batch(deltas)
                .map_err(|source| StoreError::Projection {
                    key: self.key.to_string(),
                    source,
                })?;
        }
        if let Some(chunk) = write.delta_bytes {
            state.log.push(chunk);
        }
        if let Some(checkpoint) = write.checkpoint_bytes {
            state.checkpoint_at = state.log.len();
            state.checkpoint = Some(checkpoint);
            self.shared.checkpoints.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.writes.fetch_add(1, Ordering::Relaxed);
        debug!(
            table = %self.table,
            key = %self.key,
            log_chunks = state.log.len(),
            checkpoint_at = state.checkpoint_at,
            "record written"
        );
        Ok(())
    }
}

/// Walks a table's key index from the last key it returned, so records
/// created while the cursor is open are seen if they sort after it.
struct MemoryCursor {
    table: Option<Arc<MemoryTable>>,
    query: Option<Query>,
    last: Option<IndexKey>,
    closed: bool,
    shared: Arc<Shared>,
}

impl MemoryCursor {
    fn advance(&mut self, table: &MemoryTable) -> Option<IndexKey> {
        let keys = table.keys.read().expect("lock poisoned");
        let next = match &self.last {
            Some(last) => keys.seek_after(last).next(),
            None => keys.iter().next(),
        };
        next.cloned()
    }
}

#[async_trait]
impl RecordCursor for MemoryCursor {
    async fn next(&mut self) -> StoreResult<Option<Arc<dyn RecordHandle>>> {
        if self.closed {
            return Err(StoreError::CursorClosed);
        }
        self.shared.check_open()?;
        let Some(table) = self.table.clone() else {
            return Ok(None);
        };
        while let Some(key) = self.advance(&table) {
            let record = table.records.read().expect("lock poisoned").get(&key).cloned();
            self.last = Some(key);
            if let Some(record) = record.filter(|r| r.matches(self.query.as_ref())) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> StoreResult<()> {
        self.closed = true;
        self.table = None;
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("tables", &self.table_names())
            .field("records", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use strand_codec::encode_batch;
    use strand_types::parse_path;

    use super::*;

    /// Query delta bytes setting top-level `fields` on a fresh projection.
    fn projection(key: &str, fields: serde_json::Value) -> Bytes {
        let mut doc = Document::new(RecordId::new(key));
        for (k, v) in fields.as_object().unwrap() {
            doc.set(&parse_path(k), Fragment::from_json(v)).unwrap();
        }
        encode_batch(&doc.drain_changes()).unwrap()
    }

    async fn keys(cursor: &mut Box<dyn RecordCursor>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(handle) = cursor.next().await.unwrap() {
            out.push(handle.key().to_string());
        }
        out
    }

    #[tokio::test]
    async fn open_creates_once() {
        let backend = MemoryBackend::new();
        let key = RecordId::new("r1");
        let a = backend.open("users", &key).await.unwrap();
        let b = backend.open("users", &key).await.unwrap();
        a.write(RecordWrite {
            delta_bytes: Some(Bytes::from_static(b"d1")),
            ..Default::default()
        })
        .await
        .unwrap();
        let mut stored = b.read().await.unwrap();
        assert_eq!(&stored.deltas.read_to_end().await.unwrap()[..], b"d1");
        assert_eq!(backend.len(), 1);
        assert_eq!(b.table(), "users");
    }

    #[tokio::test]
    async fn checkpoint_hides_earlier_deltas_until_compacted() {
        let backend = MemoryBackend::new();
        let handle = backend.open("t", &RecordId::new("r")).await.unwrap();
        for chunk in [&b"aa"[..], b"bb"] {
            handle
                .write(RecordWrite {
                    delta_bytes: Some(Bytes::copy_from_slice(chunk)),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        handle
            .write(RecordWrite {
                delta_bytes: Some(Bytes::from_static(b"cc")),
                checkpoint_bytes: Some(Bytes::from_static(b"snapshot")),
                ..Default::default()
            })
            .await
            .unwrap();
        handle
            .write(RecordWrite {
                delta_bytes: Some(Bytes::from_static(b"dd")),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut stored = handle.read().await.unwrap();
        assert_eq!(stored.checkpoint.as_deref(), Some(&b"snapshot"[..]));
        assert_eq!(&stored.deltas.read_to_end().await.unwrap()[..], b"dd");

        let before = backend.stats().await.unwrap();
        assert_eq!(before.delta_bytes, 8);
        assert_eq!(before.checkpoints, 1);
        assert_eq!(backend.compact().await.unwrap(), 6);
        assert_eq!(backend.stats().await.unwrap().delta_bytes, 2);

        let mut stored = handle.read().await.unwrap();
        assert_eq!(&stored.deltas.read_to_end().await.unwrap()[..], b"dd");
    }

    #[tokio::test]
    async fn query_filters_on_projection() {
        let backend = MemoryBackend::new();
        for (key, role) in [("a", "admin"), ("b", "guest"), ("c", "admin")] {
            let handle = backend.open("users", &RecordId::new(key)).await.unwrap();
            handle
                .write(RecordWrite {
                    query_delta: Some(projection(key, json!({"role": role}))),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let query = Query::new().eq("role", "admin");
        let mut cursor = backend.query("users", Some(&query)).await.unwrap();
        assert_eq!(keys(&mut cursor).await, ["a", "c"]);

        let handle = backend.open("users", &RecordId::new("b")).await.unwrap();
        let fragment = handle.query().await.unwrap();
        assert_eq!(fragment.to_json().unwrap(), json!({"role": "guest"}));
    }

    #[tokio::test]
    async fn deleted_records_are_skipped() {
        let backend = MemoryBackend::new();
        let key = RecordId::new("gone");
        let handle = backend.open("t", &key).await.unwrap();
        let mut doc = Document::new(key.clone());
        doc.mark_deleted().unwrap();
        handle
            .write(RecordWrite {
                query_delta: Some(encode_batch(&doc.drain_changes()).unwrap()),
                ..Default::default()
            })
            .await
            .unwrap();
        backend.open("t", &RecordId::new("kept")).await.unwrap();

        let mut cursor = backend.query("t", None).await.unwrap();
        assert_eq!(keys(&mut cursor).await, ["kept"]);
    }

    #[tokio::test]
    async fn cursor_walks_key_order_and_sees_later_keys() {
        let backend = MemoryBackend::new();
        for key in ["b", "aa", "a"] {
            backend.open("t", &RecordId::new(key)).await.unwrap();
        }
        let mut cursor = backend.query("t", None).await.unwrap();
        assert_eq!(cursor.next().await.unwrap().unwrap().key().as_str(), "a");
        backend.open("t", &RecordId::new("zz")).await.unwrap();
        assert_eq!(keys(&mut cursor).await, ["b", "aa", "zz"]);
    }

    #[tokio::test]
    async fn missing_table_yields_nothing() {
        let backend = MemoryBackend::new();
        let mut cursor = backend.query("nope", None).await.unwrap();
        assert!(cursor.next().await.unwrap().is_none());
        cursor.close().await.unwrap();
        assert!(matches!(cursor.next().await, Err(StoreError::CursorClosed)));
    }

    #[tokio::test]
    async fn bad_query_delta_leaves_record_untouched() {
        let backend = MemoryBackend::new();
        let handle = backend.open("t", &RecordId::new("r")).await.unwrap();
        let result = handle
            .write(RecordWrite {
                query_delta: Some(projection("other", json!({"x": 1}))),
                delta_bytes: Some(Bytes::from_static(b"d")),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(StoreError::Projection { .. })));
        assert_eq!(backend.stats().await.unwrap().delta_bytes, 0);
    }

    #[tokio::test]
    async fn closed_backend_rejects_operations() {
        let backend = MemoryBackend::new();
        let handle = backend.open("t", &RecordId::new("r")).await.unwrap();
        backend.close().await.unwrap();
        assert!(backend.is_closed());
        assert!(matches!(backend.flush().await, Err(StoreError::Closed)));
        assert!(matches!(handle.read().await, Err(StoreError::Closed)));
        assert!(matches!(
            backend.open("t", &RecordId::new("r2")).await,
            Err(StoreError::Closed)
        ));
    }

    #[test]
    fn rejects_tiny_block_size() {
        let result = MemoryBackend::with_index_config(IndexConfig { block_size: 2 });
        assert!(matches!(result, Err(StoreError::Index(_))));
    }
}
