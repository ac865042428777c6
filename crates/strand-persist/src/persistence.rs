use std::sync::Arc;

use strand_store::{Backend, RecordHandle};
use strand_types::{Document, RecordId};
use tracing::debug;

use crate::config::PersistConfig;
use crate::error::PersistResult;
use crate::record::Record;
use crate::replay::replay;

/// Entry point for one table: creates records and loads them back.
#[derive(Clone)]
pub struct Persistence {
    backend: Arc<dyn Backend>,
    table: Arc<str>,
    config: Arc<PersistConfig>,
}

impl Persistence {
    pub fn new(backend: Arc<dyn Backend>, table: &str, config: PersistConfig) -> Self {
        Self {
            backend,
            table: Arc::from(table),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// A new, empty record under a generated key.
    pub async fn create(&self) -> PersistResult<Arc<Record>> {
        self.create_with_key(RecordId::generate()).await
    }

    /// A new, empty record under `key`. Anything already stored under the
    /// key is ignored and will be shadowed by this record's writes.
    pub async fn create_with_key(&self, key: RecordId) -> PersistResult<Arc<Record>> {
        let handle = self.backend.open(&self.table, &key).await?;
        debug!(table = %self.table, key = %key, "record created");
        Ok(Arc::new(Record::new(
            handle,
            Document::new(key),
            self.config.clone(),
            0,
        )))
    }

    /// Open `key` and replay it.
    pub async fn open(&self, key: &RecordId) -> PersistResult<Arc<Record>> {
        let handle = self.backend.open(&self.table, key).await?;
        self.load(handle).await
    }

    /// Replay an existing handle (one returned by a backend query, say)
    /// into a live record.
    pub async fn load(&self, handle: Arc<dyn RecordHandle>) -> PersistResult<Arc<Record>> {
        let stored = handle.read().await?;
        let replayed = replay(handle.key(), stored, self.config.replay_mode).await?;
        Ok(Arc::new(Record::new(
            handle,
            replayed.document,
            self.config.clone(),
            replayed.since_checkpoint,
        )))
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("table", &self.table)
            .field("config", &self.config)
            .finish()
    }
}
