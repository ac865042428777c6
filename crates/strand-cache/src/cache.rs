use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use strand_index::{intersection, BTree, IndexKey};
use strand_persist::{Persistence, Record, RecordObserver};
use strand_store::RecordHandle;
use strand_types::{Delta, Query, RecordId};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::cursor::QueryCursor;
use crate::error::CacheResult;
use crate::trie::{trie_path, Segment, Trie};

/// Weak, path-indexed cache of live records in front of a [`Persistence`].
///
/// Every registered record is indexed under the trie path of each scalar it
/// holds and re-indexed whenever it changes. The cache holds records weakly:
/// when the last strong handle goes away the record's disposal is queued and
/// its trie entries are removed at the next cache operation (or by
/// [`collect`](Self::collect)). Cloning the cache is cheap and clones share
/// state.
#[derive(Clone)]
pub struct Cache {
    shared: Arc<Shared>,
}

struct Shared {
    persistence: Persistence,
    config: CacheConfig,
    inner: Mutex<Inner>,
    disposed: Mutex<UnboundedReceiver<RecordId>>,
    hook: Arc<Hook>,
    loading: Mutex<HashMap<RecordId, Arc<tokio::sync::Mutex<()>>>>,
}

struct Inner {
    trie: Trie,
    entries: HashMap<RecordId, Entry>,
    listeners: Vec<Listener>,
    hits: u64,
    misses: u64,
    disposed: u64,
}

struct Entry {
    record: Weak<Record>,
    paths: Vec<Vec<Segment>>,
}

struct Listener {
    query: Query,
    tx: UnboundedSender<Arc<Record>>,
    /// Records already sent that still match.
    notified: HashSet<RecordId>,
}

/// Observer installed on every registered record.
struct Hook {
    cache: Weak<Shared>,
    disposed: UnboundedSender<RecordId>,
}

/// Counters reported by [`Cache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Registered records, live or awaiting disposal.
    pub records: usize,
    pub trie_nodes: usize,
    pub listeners: usize,
    pub hits: u64,
    pub misses: u64,
    pub disposed: u64,
}

impl RecordObserver for Hook {
    fn on_change(&self, record: &Record, _deltas: &[Delta]) {
        if let Some(shared) = self.cache.upgrade() {
            Cache { shared }.reindex(record);
        }
    }

    fn on_dispose(&self, key: &RecordId) {
        // receiver gone means the cache is gone too
        let _ = self.disposed.send(key.clone());
    }
}

fn index_paths(record: &Record) -> Option<Vec<Vec<Segment>>> {
    record.read(|doc| {
        if doc.is_deleted() {
            return None;
        }
        let mut paths: Vec<Vec<Segment>> = doc
            .scalars()
            .iter()
            .map(|(fields, value)| trie_path(fields, value))
            .collect();
        paths.sort();
        paths.dedup();
        Some(paths)
    })
}

pub(crate) fn accepts(query: &Query, record: &Record) -> bool {
    record.read(|doc| !doc.is_deleted() && query.matches(doc))
}

impl Inner {
    fn unindex(&mut self, key: &RecordId) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        let index_key = IndexKey::from(key.as_str());
        for path in &entry.paths {
            self.trie.remove(path, &index_key);
        }
        self.trie.remove(&[], &index_key);
        Some(entry)
    }

    fn index(&mut self, record: &Arc<Record>, paths: Option<Vec<Vec<Segment>>>) {
        let key = record.key().clone();
        self.unindex(&key);
        let index_key = IndexKey::from(key.as_str());
        let paths = paths.unwrap_or_default();
        // the root holds every entry, scalar-free records included
        self.trie.insert(&[], &index_key);
        for path in &paths {
            self.trie.insert(path, &index_key);
        }
        trace!(key = %key, paths = paths.len(), "record indexed");
        self.entries.insert(
            key,
            Entry {
                record: Arc::downgrade(record),
                paths,
            },
        );
    }

    fn notify_listeners(&mut self, record: &Arc<Record>) {
        self.listeners.retain(|l| !l.tx.is_closed());
        for listener in &mut self.listeners {
            if !accepts(&listener.query, record) {
                listener.notified.remove(record.key());
            } else if listener.notified.insert(record.key().clone()) {
                let _ = listener.tx.send(record.clone());
            }
        }
    }

    fn lookup(&self, key: &RecordId) -> Option<Arc<Record>> {
        self.entries.get(key).and_then(|e| e.record.upgrade())
    }

    /// Keys of cached records sitting at every constraint's node.
    fn candidates(&self, query: &Query) -> Vec<RecordId> {
        let trees: Option<Vec<&BTree>> = if query.is_empty() {
            self.trie.members(&[]).map(|root| vec![root])
        } else {
            query
                .constraints
                .iter()
                .map(|c| self.trie.members(&trie_path(&c.path, &c.value)))
                .collect()
        };
        let Some(trees) = trees else {
            return Vec::new();
        };
        intersection(&trees)
            .filter_map(|k| k.as_str().map(RecordId::new))
            .collect()
    }
}

impl Cache {
    pub fn new(persistence: Persistence, config: CacheConfig) -> CacheResult<Self> {
        let empty = BTree::with_config(&config.index)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new_cyclic(|weak| Shared {
            persistence,
            config,
            inner: Mutex::new(Inner {
                trie: Trie::new(empty),
                entries: HashMap::new(),
                listeners: Vec::new(),
                hits: 0,
                misses: 0,
                disposed: 0,
            }),
            disposed: Mutex::new(rx),
            hook: Arc::new(Hook {
                cache: weak.clone(),
                disposed: tx,
            }),
            loading: Mutex::new(HashMap::new()),
        });
        Ok(Self { shared })
    }

    pub fn persistence(&self) -> &Persistence {
        &self.shared.persistence
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared.inner.lock().expect("lock poisoned")
    }

    /// Index a live record and start following its changes. Registering the
    /// same record twice is a no-op; a different record with the same key
    /// replaces the earlier one.
    pub fn register(&self, record: &Arc<Record>) {
        self.drain();
        let paths = index_paths(record);
        let mut inner = self.inner();
        if let Some(entry) = inner.entries.get(record.key()) {
            if std::ptr::eq(entry.record.as_ptr(), Arc::as_ptr(record)) {
                return;
            }
        }
        record.observe(&self.shared.hook);
        inner.index(record, paths);
        inner.notify_listeners(record);
        debug!(key = %record.key(), "record registered");
    }

    fn reindex(&self, record: &Record) {
        let paths = index_paths(record);
        let mut inner = self.inner();
        let Some(live) = inner
            .entries
            .get(record.key())
            .filter(|e| std::ptr::eq(e.record.as_ptr(), record))
            .and_then(|e| e.record.upgrade())
        else {
            return;
        };
        inner.index(&live, paths);
        inner.notify_listeners(&live);
    }

    /// A new empty record, registered.
    pub async fn create(&self) -> CacheResult<Arc<Record>> {
        let record = self.shared.persistence.create().await?;
        self.register(&record);
        Ok(record)
    }

    /// The cached record for `key`, without touching the backend.
    pub fn cached(&self, key: &RecordId) -> Option<Arc<Record>> {
        self.drain();
        self.inner().lookup(key)
    }

    /// The record for `key`, loading it from the backend on a miss.
    /// Concurrent misses on one key share a single load.
    pub async fn get(&self, key: &RecordId) -> CacheResult<Arc<Record>> {
        if let Some(record) = self.cached(key) {
            self.inner().hits += 1;
            return Ok(record);
        }
        self.load_once(key, None).await
    }

    pub(crate) async fn load_once(
        &self,
        key: &RecordId,
        handle: Option<Arc<dyn RecordHandle>>,
    ) -> CacheResult<Arc<Record>> {
        let gate = self
            .shared
            .loading
            .lock()
            .expect("lock poisoned")
            .entry(key.clone())
            .or_default()
            .clone();
        let guard = gate.lock().await;
        let result = self.load_locked(key, handle).await;
        drop(guard);

        let mut loading = self.shared.loading.lock().expect("lock poisoned");
        if Arc::strong_count(&gate) <= 2 {
            loading.remove(key);
        }
        result
    }

    async fn load_locked(
        &self,
        key: &RecordId,
        handle: Option<Arc<dyn RecordHandle>>,
    ) -> CacheResult<Arc<Record>> {
        if let Some(record) = self.cached(key) {
            return Ok(record);
        }
        self.inner().misses += 1;
        let record = match handle {
            Some(handle) => self.shared.persistence.load(handle).await?,
            None => self.shared.persistence.open(key).await?,
        };
        self.register(&record);
        Ok(record)
    }

    /// Iterate records matching `query`: cached ones first, then the
    /// backend's, each at most once.
    pub fn find(&self, query: Query) -> QueryCursor {
        self.drain();
        let candidates = self.inner().candidates(&query);
        trace!(candidates = candidates.len(), "query planned");
        QueryCursor::new(self.clone(), query, candidates)
    }

    pub(crate) fn hit(&self) {
        self.inner().hits += 1;
    }

    /// Receive every record that starts matching `query` from now on, as it
    /// is registered or changed. Records already matching are not sent.
    pub fn listen(&self, query: Query) -> UnboundedReceiver<Arc<Record>> {
        self.drain();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner();
        let notified = inner
            .entries
            .iter()
            .filter(|(_, e)| e.record.upgrade().is_some_and(|r| accepts(&query, &r)))
            .map(|(k, _)| k.clone())
            .collect();
        inner.listeners.push(Listener {
            query,
            tx,
            notified,
        });
        rx
    }

    /// Apply queued disposals. Returns how many records were dropped.
    fn drain(&self) -> usize {
        let keys: Vec<RecordId> = {
            let mut rx = self.shared.disposed.lock().expect("lock poisoned");
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        if keys.is_empty() {
            return 0;
        }
        let mut inner = self.inner();
        let mut dropped = 0;
        for key in keys {
            let dead = inner
                .entries
                .get(&key)
                .is_some_and(|e| e.record.strong_count() == 0);
            if dead && inner.unindex(&key).is_some() {
                for listener in &mut inner.listeners {
                    listener.notified.remove(&key);
                }
                dropped += 1;
            }
        }
        inner.disposed += dropped as u64;
        debug!(dropped, "disposed records removed");
        dropped
    }

    /// Apply queued disposals and sweep any entry whose record is gone.
    pub fn collect(&self) -> usize {
        let mut dropped = self.drain();
        let mut inner = self.inner();
        let dead: Vec<RecordId> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.record.strong_count() == 0)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &dead {
            inner.unindex(key);
        }
        inner.disposed += dead.len() as u64;
        dropped += dead.len();
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.drain();
        let inner = self.inner();
        CacheStats {
            records: inner.entries.len(),
            trie_nodes: inner.trie.node_count(),
            listeners: inner.listeners.iter().filter(|l| !l.tx.is_closed()).count(),
            hits: inner.hits,
            misses: inner.misses,
            disposed: inner.disposed,
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("table", &self.shared.persistence.table())
            .field("records", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use strand_persist::PersistConfig;
    use strand_store::MemoryBackend;
    use strand_types::{parse_path, Fragment};

    use super::*;

    fn persistence() -> Persistence {
        Persistence::new(Arc::new(MemoryBackend::new()), "people", PersistConfig::default())
    }

    fn cache_only(persistence: Persistence) -> Cache {
        let config = CacheConfig {
            fall_through: false,
            ..Default::default()
        };
        Cache::new(persistence, config).unwrap()
    }

    fn set(record: &Record, path: &str, value: impl Into<Fragment>) {
        let value = value.into();
        record.mutate(|doc| doc.set(&parse_path(path), value)).unwrap();
    }

    fn keys(records: &[Arc<Record>]) -> Vec<String> {
        records.iter().map(|r| r.key().to_string()).collect()
    }

    async fn stored(persistence: &Persistence, key: &str, role: &str) -> Arc<Record> {
        let record = persistence.create_with_key(RecordId::new(key)).await.unwrap();
        set(&record, "role", role);
        record.flush().await.unwrap();
        record
    }

    #[tokio::test]
    async fn find_serves_cache_then_backend_once_each() {
        let persistence = persistence();
        let a = stored(&persistence, "a", "admin").await;
        drop(stored(&persistence, "b", "admin").await);
        drop(stored(&persistence, "c", "user").await);

        let cache = Cache::new(persistence, CacheConfig::default()).unwrap();
        cache.register(&a);
        let found = cache
            .find(Query::new().eq("role", "admin"))
            .collect_all()
            .await
            .unwrap();
        assert_eq!(keys(&found), ["a", "b"]);
        assert!(Arc::ptr_eq(&found[0], &a));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!(cache.cached(&RecordId::new("b")).is_some());
        assert!(cache.cached(&RecordId::new("c")).is_none());
    }

    #[tokio::test]
    async fn constraints_intersect() {
        let cache = cache_only(persistence());
        let mut held = Vec::new();
        for (role, team) in [("admin", "x"), ("admin", "y"), ("user", "x")] {
            let record = cache.create().await.unwrap();
            set(&record, "role", role);
            set(&record, "team", team);
            held.push(record);
        }

        let query = Query::new().eq("role", "admin").eq("team", "x");
        let found = cache.find(query).collect_all().await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0], &held[0]));

        let everything = cache.find(Query::new()).collect_all().await.unwrap();
        assert_eq!(everything.len(), 3);
        let none = cache.find(Query::new().eq("team", "z")).collect_all().await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn empty_query_finds_records_without_scalars() {
        let cache = cache_only(persistence());
        let empty = cache.create().await.unwrap();
        let filled = cache.create().await.unwrap();
        set(&filled, "a", 1i64);

        let found = cache.find(Query::new()).collect_all().await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|r| Arc::ptr_eq(r, &empty)));

        drop(found);
        drop(empty);
        let found = cache.find(Query::new()).collect_all().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(cache.stats().records, 1);
    }

    #[tokio::test]
    async fn changes_move_records_between_paths() {
        let cache = cache_only(persistence());
        let record = cache.create().await.unwrap();
        set(&record, "city", "Paris");

        let count = |city: &'static str| {
            let cache = cache.clone();
            async move {
                cache
                    .find(Query::new().eq("city", city))
                    .collect_all()
                    .await
                    .unwrap()
                    .len()
            }
        };
        assert_eq!(count("Paris").await, 1);
        set(&record, "city", "Oslo");
        assert_eq!(count("Paris").await, 0);
        assert_eq!(count("Oslo").await, 1);
    }

    #[tokio::test]
    async fn nested_fields_and_array_elements_are_indexed() {
        let cache = cache_only(persistence());
        let record = cache.create().await.unwrap();
        set(&record, "address", Fragment::from_json(&json!({"city": "Paris"})));
        set(&record, "tags", Fragment::from_json(&json!(["x", "y"])));

        for query in [
            Query::new().eq("address.city", "Paris"),
            Query::new().eq("tags", "y"),
            Query::new().eq("tags", "x").eq("address.city", "Paris"),
        ] {
            let found = cache.find(query).collect_all().await.unwrap();
            assert_eq!(found.len(), 1);
        }
        let found = cache.find(Query::new().eq("city", "Paris")).collect_all().await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn dropped_records_leave_the_trie() {
        let cache = cache_only(persistence());
        let record = cache.create().await.unwrap();
        set(&record, "a", 1i64);
        assert_eq!(cache.stats().records, 1);
        assert!(cache.stats().trie_nodes > 1);

        drop(record);
        let stats = cache.stats();
        assert_eq!(stats.records, 0);
        assert_eq!(stats.trie_nodes, 1);
        assert_eq!(stats.disposed, 1);
        assert_eq!(cache.collect(), 0);
    }

    #[tokio::test]
    async fn deleted_records_are_not_found() {
        let cache = Cache::new(persistence(), CacheConfig::default()).unwrap();
        let record = cache.create().await.unwrap();
        set(&record, "role", "admin");
        record.flush().await.unwrap();
        record.delete().unwrap();

        // the stored projection still matches until the delete is flushed
        let found = cache
            .find(Query::new().eq("role", "admin"))
            .collect_all()
            .await
            .unwrap();
        assert!(found.is_empty());
        assert!(cache.cached(record.key()).is_some());
    }

    #[tokio::test]
    async fn listeners_hear_each_new_match_once() {
        let cache = cache_only(persistence());
        let early = cache.create().await.unwrap();
        set(&early, "role", "admin");

        let mut rx = cache.listen(Query::new().eq("role", "admin"));
        let record = cache.create().await.unwrap();
        assert!(rx.try_recv().is_err());

        set(&record, "role", "admin");
        assert!(Arc::ptr_eq(&rx.try_recv().unwrap(), &record));
        set(&record, "name", "ada");
        assert!(rx.try_recv().is_err());

        set(&record, "role", "user");
        set(&record, "role", "admin");
        assert!(Arc::ptr_eq(&rx.try_recv().unwrap(), &record));
        assert!(rx.try_recv().is_err());
        assert_eq!(cache.stats().listeners, 1);

        drop(rx);
        assert_eq!(cache.stats().listeners, 0);
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_load() {
        let persistence = persistence();
        drop(stored(&persistence, "k", "admin").await);

        let cache = cache_only(persistence);
        let key = RecordId::new("k");
        let (a, b) = tokio::join!(cache.get(&key), cache.get(&key));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(a.read(|doc| doc.to_json().unwrap()), json!({"role": "admin"}));
    }

    #[tokio::test]
    async fn re_registering_a_replacement_keeps_the_newest() {
        let persistence = persistence();
        let cache = cache_only(persistence.clone());
        let first = stored(&persistence, "k", "admin").await;
        cache.register(&first);
        cache.register(&first);
        assert_eq!(cache.len(), 1);

        let second = persistence.open(first.key()).await.unwrap();
        cache.register(&second);
        drop(first);
        assert_eq!(cache.stats().records, 1);
        assert!(Arc::ptr_eq(&cache.cached(second.key()).unwrap(), &second));
    }

    #[test]
    fn rejects_tiny_block_size() {
        let mut config = CacheConfig::default();
        config.index.block_size = 1;
        assert!(matches!(
            Cache::new(persistence(), config),
            Err(crate::error::CacheError::Index(_))
        ));
    }
}
