use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use strand_codec::{encode_batch, to_bytes};
use strand_store::{RecordHandle, RecordWrite};
use strand_types::{Delta, Document, RecordId, TypeResult};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::config::PersistConfig;
use crate::error::{PersistError, PersistResult};
use crate::log::frame;
use crate::tracker::ChangeTracker;

/// Receives a record's change and disposal notifications.
///
/// Records hold observers weakly. `on_change` runs after the record's own
/// lock is released, so an observer may read the record. `on_dispose` runs
/// inside `Drop` and must not block.
pub trait RecordObserver: Send + Sync {
    fn on_change(&self, record: &Record, deltas: &[Delta]);

    fn on_dispose(&self, key: &RecordId);
}

/// A live, mutation-tracked record bound to its backend handle.
///
/// Mutations go through [`mutate`](Self::mutate) and are queued on two
/// trackers: the full instance stream and the query projection. A flush
/// writes both in one backend write, adding a checkpoint every
/// `checkpoint_every` deltas. Flushes are serialized per record: a flush
/// requested while another is in flight waits for it and then writes
/// whatever was queued in the meantime.
pub struct Record {
    key: RecordId,
    handle: Arc<dyn RecordHandle>,
    config: Arc<PersistConfig>,
    state: RwLock<State>,
    flush: tokio::sync::Mutex<FlushState>,
    observers: Mutex<Vec<Weak<dyn RecordObserver>>>,
    digest: Mutex<Option<JoinHandle<()>>>,
}

struct State {
    document: Document,
    instance: ChangeTracker,
    projection: ChangeTracker,
}

struct FlushState {
    since_checkpoint: u32,
}

impl Record {
    pub(crate) fn new(
        handle: Arc<dyn RecordHandle>,
        document: Document,
        config: Arc<PersistConfig>,
        since_checkpoint: u32,
    ) -> Self {
        Self {
            key: handle.key().clone(),
            handle,
            config,
            state: RwLock::new(State {
                document,
                instance: ChangeTracker::new(),
                projection: ChangeTracker::new(),
            }),
            flush: tokio::sync::Mutex::new(FlushState { since_checkpoint }),
            observers: Mutex::new(Vec::new()),
            digest: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &RecordId {
        &self.key
    }

    pub fn handle(&self) -> &Arc<dyn RecordHandle> {
        &self.handle
    }

    pub fn is_deleted(&self) -> bool {
        self.state.read().expect("lock poisoned").document.is_deleted()
    }

    /// Deltas queued on the instance stream and not yet written.
    pub fn pending(&self) -> usize {
        self.state.read().expect("lock poisoned").instance.len()
    }

    pub fn has_pending(&self) -> bool {
        let state = self.state.read().expect("lock poisoned");
        !state.instance.is_empty() || !state.projection.is_empty()
    }

    /// Run `f` against the current document.
    pub fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.state.read().expect("lock poisoned").document)
    }

    /// Mutate the document. Whatever `f` changed is queued for the next
    /// flush even when `f` fails part way.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Document) -> TypeResult<R>) -> PersistResult<R> {
        let (result, changes) = {
            let mut state = self.state.write().expect("lock poisoned");
            if state.document.is_deleted() {
                return Err(PersistError::Deleted(self.key.to_string()));
            }
            let result = f(&mut state.document);
            let changes = state.document.drain_changes();
            for delta in &changes {
                if self.config.projects(delta) {
                    state.projection.push(delta.clone());
                }
                state.instance.push(delta.clone());
            }
            (result, changes)
        };
        if !changes.is_empty() {
            self.notify(&changes);
        }
        Ok(result?)
    }

    /// Logically delete the record. Takes effect in storage at the next flush.
    pub fn delete(&self) -> PersistResult<()> {
        self.mutate(|doc| doc.mark_deleted())
    }

    /// Write everything queued. Returns `false` when there was nothing to do.
    ///
    /// On a failed write the deltas go back in front of the trackers and the
    /// error is returned; nothing is retried here.
    pub async fn flush(&self) -> PersistResult<bool> {
        let mut flush = self.flush.lock().await;

        let (instance, projection, write) = {
            let mut state = self.state.write().expect("lock poisoned");
            let instance = state.instance.take();
            let projection = state.projection.take();
            if instance.is_empty() && projection.is_empty() {
                return Ok(false);
            }
            let checkpoint = self.checkpoint_due(flush.since_checkpoint, instance.len())
                && !state.document.is_deleted();
            if checkpoint {
                let freed = state.document.compact();
                trace!(key = %self.key, freed, "arena compacted for checkpoint");
            }
            match encode_write(&state.document, &instance, &projection, checkpoint) {
                Ok(write) => (instance, projection, write),
                Err(e) => {
                    state.instance.requeue(instance);
                    state.projection.requeue(projection);
                    return Err(e);
                }
            }
        };

        let checkpointed = write.checkpoint_bytes.is_some();
        match self.handle.write(write).await {
            Ok(()) => {
                if checkpointed {
                    flush.since_checkpoint = 0;
                } else {
                    flush.since_checkpoint += instance.len() as u32;
                }
                debug!(
                    key = %self.key,
                    deltas = instance.len(),
                    projected = projection.len(),
                    checkpointed,
                    "record flushed"
                );
                Ok(true)
            }
            Err(e) => {
                let mut state = self.state.write().expect("lock poisoned");
                state.instance.requeue(instance);
                state.projection.requeue(projection);
                warn!(key = %self.key, error = %e, "flush failed; changes requeued");
                Err(e.into())
            }
        }
    }

    fn checkpoint_due(&self, since: u32, adding: usize) -> bool {
        let every = self.config.checkpoint_every;
        every > 0 && adding > 0 && since + adding as u32 >= every
    }

    /// Register an observer. It is held weakly and dropped once gone.
    pub fn observe<O: RecordObserver + 'static>(&self, observer: &Arc<O>) {
        let weak: Weak<dyn RecordObserver> = Arc::downgrade(observer) as Weak<dyn RecordObserver>;
        self.observers.lock().expect("lock poisoned").push(weak);
    }

    fn live_observers(&self) -> Vec<Arc<dyn RecordObserver>> {
        let mut observers = self.observers.lock().expect("lock poisoned");
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    fn notify(&self, changes: &[Delta]) {
        for observer in self.live_observers() {
            observer.on_change(self, changes);
        }
    }

    /// Flush every squash window from a background task. The task holds the
    /// record weakly and ends when the record is dropped or
    /// [`stop_digest`](Self::stop_digest) is called.
    pub fn start_digest(self: &Arc<Self>) {
        let mut digest = self.digest.lock().expect("lock poisoned");
        if digest.is_some() {
            return;
        }
        let record = Arc::downgrade(self);
        let period = self.config.squash_window().max(Duration::from_millis(1));
        *digest = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(record) = record.upgrade() else {
                    break;
                };
                if !record.has_pending() {
                    continue;
                }
                if let Err(e) = record.flush().await {
                    warn!(key = %record.key, error = %e, "digest flush failed");
                }
            }
        }));
        debug!(key = %self.key, period_ms = period.as_millis() as u64, "digest started");
    }

    pub fn stop_digest(&self) {
        if let Some(task) = self.digest.lock().expect("lock poisoned").take() {
            task.abort();
        }
    }
}

fn encode_write(
    document: &Document,
    instance: &[Delta],
    projection: &[Delta],
    checkpoint: bool,
) -> PersistResult<RecordWrite> {
    let mut write = RecordWrite::default();
    if !instance.is_empty() {
        write.delta_bytes = Some(frame(&encode_batch(instance)?)?);
    }
    if !projection.is_empty() {
        write.query_delta = Some(encode_batch(projection)?);
    }
    if checkpoint {
        write.checkpoint_bytes = Some(to_bytes(document.graph(), &document.root())?);
    }
    Ok(write)
}

impl Drop for Record {
    fn drop(&mut self) {
        if let Ok(Some(task)) = self.digest.get_mut().map(Option::take) {
            task.abort();
        }
        let pending = self.state.get_mut().map(|s| s.instance.len()).unwrap_or(0);
        if pending > 0 {
            warn!(key = %self.key, pending, "record dropped with unflushed changes");
        }
        let observers = self.observers.get_mut().map(std::mem::take).unwrap_or_default();
        for observer in observers.iter().filter_map(Weak::upgrade) {
            observer.on_dispose(&self.key);
        }
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("key", &self.key)
            .field("table", &self.handle.table())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use strand_store::{StoreError, StoreResult, StoredRecord};
    use strand_stream::StreamReader;
    use strand_types::{parse_path, Fragment, Scalar};

    use super::*;
    use crate::config::ReplayMode;
    use crate::replay::replay;

    /// Handle that keeps every write and tracks overlapping writes.
    struct Recorder {
        key: RecordId,
        writes: Mutex<Vec<RecordWrite>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        fail_next: AtomicBool,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                key: RecordId::new("rec"),
                writes: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
                fail_next: AtomicBool::new(false),
            })
        }

        /// Stored view as of the checkpoint in write `at`, or the full log.
        fn stored(&self, at: Option<usize>) -> StoredRecord {
            let writes = self.writes.lock().unwrap();
            let (checkpoint, from) = match at {
                Some(i) => (writes[i].checkpoint_bytes.clone(), i + 1),
                None => (None, 0),
            };
            let chunks: Vec<_> = writes[from..]
                .iter()
                .filter_map(|w| w.delta_bytes.clone())
                .collect();
            StoredRecord {
                checkpoint,
                deltas: StreamReader::from_chunks(chunks),
            }
        }

        fn checkpoints(&self) -> Vec<usize> {
            let writes = self.writes.lock().unwrap();
            (0..writes.len())
                .filter(|&i| writes[i].checkpoint_bytes.is_some())
                .collect()
        }
    }

    #[async_trait]
    impl RecordHandle for Recorder {
        fn key(&self) -> &RecordId {
            &self.key
        }

        fn table(&self) -> &str {
            "test"
        }

        async fn query(&self) -> StoreResult<Fragment> {
            Ok(Fragment::from(Scalar::Null))
        }

        async fn read(&self) -> StoreResult<StoredRecord> {
            Ok(self.stored(None))
        }

        async fn write(&self, write: RecordWrite) -> StoreResult<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Backend("injected failure".into()));
            }
            self.writes.lock().unwrap().push(write);
            Ok(())
        }
    }

    fn record(recorder: &Arc<Recorder>, config: PersistConfig) -> Arc<Record> {
        let handle: Arc<dyn RecordHandle> = recorder.clone();
        Arc::new(Record::new(
            handle,
            Document::new(recorder.key.clone()),
            Arc::new(config),
            0,
        ))
    }

    fn set(record: &Record, path: &str, value: impl Into<Fragment>) {
        let value = value.into();
        record.mutate(|doc| doc.set(&parse_path(path), value)).unwrap();
    }

    fn json_of(record: &Record) -> serde_json::Value {
        record.read(|doc| doc.to_json().unwrap())
    }

    #[tokio::test]
    async fn checkpoint_and_full_log_replays_agree() {
        let recorder = Recorder::new(Duration::ZERO);
        let config = PersistConfig {
            checkpoint_every: 3,
            ..Default::default()
        };
        let rec = record(&recorder, config);
        set(&rec, "items", Fragment::from_json(&json!([])));
        rec.flush().await.unwrap();

        for i in 0..12i64 {
            rec.mutate(|doc| {
                doc.set(&parse_path("count"), i)?;
                doc.insert(&parse_path("items.0"), Fragment::from_json(&json!({"n": i})))?;
                if i % 4 == 3 {
                    doc.delete(&parse_path("items.1"))?;
                    doc.set(&parse_path("meta"), Fragment::from_json(&json!({"round": i})))?;
                }
                Ok(())
            })
            .unwrap();
            assert!(rec.flush().await.unwrap());
        }
        let expected = json_of(&rec);

        let full = replay(rec.key(), recorder.stored(None), ReplayMode::Strict)
            .await
            .unwrap();
        assert_eq!(full.document.to_json().unwrap(), expected);

        let checkpoints = recorder.checkpoints();
        assert!(checkpoints.len() >= 2, "checkpoints at {checkpoints:?}");
        for at in checkpoints {
            let tail = replay(rec.key(), recorder.stored(Some(at)), ReplayMode::Strict)
                .await
                .unwrap();
            assert_eq!(tail.document.to_json().unwrap(), expected, "checkpoint at write {at}");
        }
    }

    #[tokio::test]
    async fn array_shift_between_rewrites_survives_replay() {
        let recorder = Recorder::new(Duration::ZERO);
        let rec = record(&recorder, PersistConfig::default());
        set(&rec, "items", Fragment::from_json(&json!(["A", "B", "C"])));
        rec.flush().await.unwrap();

        rec.mutate(|doc| {
            doc.set(&parse_path("items.1"), "X")?;
            doc.delete(&parse_path("items.0"))?;
            doc.set(&parse_path("items.1"), "Y")
        })
        .unwrap();
        rec.flush().await.unwrap();
        assert_eq!(json_of(&rec), json!({"items": ["X", "Y"]}));

        let replayed = replay(rec.key(), recorder.stored(None), ReplayMode::Strict)
            .await
            .unwrap();
        assert_eq!(replayed.document.to_json().unwrap(), json_of(&rec));
    }

    #[tokio::test]
    async fn checkpoint_compacts_the_arena() {
        let recorder = Recorder::new(Duration::ZERO);
        // four rewrites squash to an insert and one modify
        let config = PersistConfig {
            checkpoint_every: 2,
            ..Default::default()
        };
        let rec = record(&recorder, config);
        for i in 0..4i64 {
            set(&rec, "blob", Fragment::from_json(&json!({"n": i})));
        }
        assert!(rec.read(|doc| doc.graph().len()) > 2);
        rec.flush().await.unwrap();

        assert_eq!(recorder.checkpoints(), vec![0]);
        assert_eq!(rec.read(|doc| doc.graph().len()), 2);
        let replayed = replay(rec.key(), recorder.stored(Some(0)), ReplayMode::Strict)
            .await
            .unwrap();
        assert_eq!(replayed.document.to_json().unwrap(), json!({"blob": {"n": 3}}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_flushes_never_overlap() {
        let recorder = Recorder::new(Duration::from_millis(5));
        let rec = record(&recorder, PersistConfig::default());

        let mut tasks = Vec::new();
        for i in 0..8i64 {
            set(&rec, &format!("f{}", i % 3), i);
            let r = rec.clone();
            tasks.push(tokio::spawn(async move { r.flush().await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        rec.flush().await.unwrap();

        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(rec.pending(), 0);
        let replayed = replay(rec.key(), recorder.stored(None), ReplayMode::Strict)
            .await
            .unwrap();
        assert_eq!(replayed.document.to_json().unwrap(), json_of(&rec));
        assert_eq!(json_of(&rec), json!({"f0": 6, "f1": 7, "f2": 5}));
    }

    #[tokio::test]
    async fn failed_write_requeues_changes() {
        let recorder = Recorder::new(Duration::ZERO);
        let rec = record(&recorder, PersistConfig::default());
        recorder.fail_next.store(true, Ordering::SeqCst);

        set(&rec, "a", 1i64);
        let err = rec.flush().await.unwrap_err();
        assert!(matches!(err, PersistError::Store(StoreError::Backend(_))));
        assert_eq!(rec.pending(), 1);

        set(&rec, "b", 2i64);
        assert!(rec.flush().await.unwrap());
        assert_eq!(recorder.writes.lock().unwrap().len(), 1);
        let replayed = replay(rec.key(), recorder.stored(None), ReplayMode::Strict)
            .await
            .unwrap();
        assert_eq!(replayed.document.to_json().unwrap(), json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn empty_flush_writes_nothing() {
        let recorder = Recorder::new(Duration::ZERO);
        let rec = record(&recorder, PersistConfig::default());
        assert!(!rec.flush().await.unwrap());
        assert!(recorder.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_mutation_still_queues_what_it_changed() {
        let recorder = Recorder::new(Duration::ZERO);
        let rec = record(&recorder, PersistConfig::default());
        let result = rec.mutate(|doc| {
            doc.set(&parse_path("a"), 1i64)?;
            doc.delete(&parse_path("missing"))
        });
        assert!(matches!(result, Err(PersistError::Type(_))));
        assert_eq!(rec.pending(), 1);
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl RecordObserver for Events {
        fn on_change(&self, record: &Record, deltas: &[Delta]) {
            let n = record.read(|doc| doc.get_scalar(&parse_path("n")));
            self.0
                .lock()
                .unwrap()
                .push(format!("change:{}:{:?}", deltas.len(), n));
        }

        fn on_dispose(&self, key: &RecordId) {
            self.0.lock().unwrap().push(format!("dispose:{key}"));
        }
    }

    #[tokio::test]
    async fn observers_see_changes_and_disposal() {
        let recorder = Recorder::new(Duration::ZERO);
        let rec = record(&recorder, PersistConfig::default());
        let events = Arc::new(Events::default());
        rec.observe(&events);

        set(&rec, "n", 7i64);
        drop(rec);
        assert_eq!(
            *events.0.lock().unwrap(),
            vec![
                format!("change:1:{:?}", Some(Scalar::Int(7))),
                "dispose:rec".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn deleted_records_reject_mutation() {
        let recorder = Recorder::new(Duration::ZERO);
        let rec = record(&recorder, PersistConfig::default());
        set(&rec, "a", 1i64);
        rec.delete().unwrap();
        assert!(rec.is_deleted());
        assert!(matches!(
            rec.mutate(|doc| doc.set(&parse_path("a"), 2i64)),
            Err(PersistError::Deleted(_))
        ));
        rec.flush().await.unwrap();
        let replayed = replay(rec.key(), recorder.stored(None), ReplayMode::Strict)
            .await
            .unwrap();
        assert!(replayed.document.is_deleted());
    }

    #[tokio::test]
    async fn digest_flushes_in_the_background() {
        let recorder = Recorder::new(Duration::ZERO);
        let config = PersistConfig {
            squash_window_ms: 10,
            ..Default::default()
        };
        let rec = record(&recorder, config);
        rec.start_digest();
        set(&rec, "a", 1i64);
        set(&rec, "a", 2i64);

        for _ in 0..50 {
            if rec.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rec.pending(), 0);
        let writes = recorder.writes.lock().unwrap().len();
        assert_eq!(writes, 1);
        rec.stop_digest();
    }
}
