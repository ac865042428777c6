use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use strand_persist::Record;
use strand_store::RecordCursor;
use strand_types::{Query, RecordId};
use tracing::trace;

use crate::cache::{accepts, Cache};
use crate::error::CacheResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Cache,
    Backend,
    Done,
}

/// Results of [`Cache::find`].
///
/// Cached candidates come first, checked against the live record. With
/// fall-through enabled the backend is queried next; its hits are loaded
/// through the cache (so a record already live is reused, not replayed) and
/// checked again, since the stored projection can lag the live state. No
/// key is yielded twice.
pub struct QueryCursor {
    cache: Cache,
    query: Query,
    candidates: VecDeque<RecordId>,
    seen: HashSet<RecordId>,
    backend: Option<Box<dyn RecordCursor>>,
    phase: Phase,
}

impl QueryCursor {
    pub(crate) fn new(cache: Cache, query: Query, candidates: Vec<RecordId>) -> Self {
        Self {
            cache,
            query,
            candidates: candidates.into(),
            seen: HashSet::new(),
            backend: None,
            phase: Phase::Cache,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub async fn next(&mut self) -> CacheResult<Option<Arc<Record>>> {
        loop {
            match self.phase {
                Phase::Cache => {
                    if let Some(record) = self.next_cached() {
                        return Ok(Some(record));
                    }
                    self.phase = if self.cache.config().fall_through {
                        Phase::Backend
                    } else {
                        Phase::Done
                    };
                }
                Phase::Backend => {
                    if let Some(record) = self.next_stored().await? {
                        return Ok(Some(record));
                    }
                    self.close().await?;
                }
                Phase::Done => return Ok(None),
            }
        }
    }

    fn next_cached(&mut self) -> Option<Arc<Record>> {
        while let Some(key) = self.candidates.pop_front() {
            let Some(record) = self.cache.cached(&key) else {
                continue;
            };
            if !self.seen.insert(key) {
                continue;
            }
            if accepts(&self.query, &record) {
                self.cache.hit();
                return Some(record);
            }
        }
        None
    }

    async fn next_stored(&mut self) -> CacheResult<Option<Arc<Record>>> {
        if self.backend.is_none() {
            let persistence = self.cache.persistence();
            let cursor = persistence
                .backend()
                .query(persistence.table(), Some(&self.query))
                .await?;
            self.backend = Some(cursor);
        }
        let Some(cursor) = self.backend.as_mut() else {
            return Ok(None);
        };
        while let Some(handle) = cursor.next().await? {
            let key = handle.key().clone();
            if self.seen.contains(&key) {
                continue;
            }
            let record = self.cache.load_once(&key, Some(handle)).await?;
            self.seen.insert(key);
            if accepts(&self.query, &record) {
                return Ok(Some(record));
            }
            trace!(key = %record.key(), "stored match is stale");
        }
        Ok(None)
    }

    /// Release the backend cursor. Further calls to [`next`](Self::next)
    /// yield nothing.
    pub async fn close(&mut self) -> CacheResult<()> {
        self.phase = Phase::Done;
        self.candidates.clear();
        if let Some(mut cursor) = self.backend.take() {
            cursor.close().await?;
        }
        Ok(())
    }

    /// Drain the cursor into a vector.
    pub async fn collect_all(mut self) -> CacheResult<Vec<Arc<Record>>> {
        let mut out = Vec::new();
        while let Some(record) = self.next().await? {
            out.push(record);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for QueryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCursor")
            .field("phase", &self.phase)
            .field("candidates", &self.candidates.len())
            .field("seen", &self.seen.len())
            .finish()
    }
}
