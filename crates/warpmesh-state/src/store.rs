//! StateStore — redb-backed, revisioned key-value store.
//!
//! Every committed mutation gets the next store revision. Mutations are
//! serialized through the event log lock so that the revision order,
//! the redb commit order, and the order in which watchers observe events
//! are all the same.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::keys;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Events retained for `events_since` / long-poll watchers.
pub const DEFAULT_HISTORY: usize = 4096;

/// Buffer of the live broadcast channel; slower watchers get `Compacted`.
const BROADCAST_BUFFER: usize = 1024;

/// Thread-safe revisioned key-value store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    log: Mutex<EventLog>,
    events: broadcast::Sender<KvEvent>,
}

/// Bounded history of committed events.
struct EventLog {
    revision: u64,
    /// Highest revision no longer present in `history`.
    compacted: u64,
    history: VecDeque<KvEvent>,
    capacity: usize,
}

impl EventLog {
    fn record(&mut self, event: KvEvent) {
        if self.history.len() == self.capacity {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision;
            }
        }
        self.revision = event.revision;
        self.history.push_back(event);
    }

    fn since(&self, prefix: &str, since: u64) -> StateResult<Vec<KvEvent>> {
        if since < self.compacted {
            return Err(StateError::Compacted {
                requested: since,
                compacted: self.compacted,
            });
        }
        Ok(self
            .history
            .iter()
            .filter(|e| e.revision > since && e.key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db, DEFAULT_HISTORY)?;
        debug!(?path, revision = store.revision()?, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        Self::open_in_memory_with_history(DEFAULT_HISTORY)
    }

    /// In-memory store retaining at most `history` events for resumption.
    pub fn open_in_memory_with_history(history: usize) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db, history)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database, history: usize) -> StateResult<Self> {
        let revision = ensure_tables(&db)?;
        let (events, _) = broadcast::channel(BROADCAST_BUFFER);
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                log: Mutex::new(EventLog {
                    revision,
                    // Nothing before a reopen can be replayed.
                    compacted: revision,
                    history: VecDeque::with_capacity(history.min(DEFAULT_HISTORY)),
                    capacity: history.max(1),
                }),
                events,
            }),
        })
    }

    fn lock_log(&self) -> StateResult<MutexGuard<'_, EventLog>> {
        self.inner.log.lock().map_err(|_| StateError::Poisoned)
    }

    /// Last committed revision.
    pub fn revision(&self) -> StateResult<u64> {
        Ok(self.lock_log()?.revision)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert or update a key. Returns the revision of the write.
    pub fn put(&self, key: &str, value: &[u8]) -> StateResult<u64> {
        let mut log = self.lock_log()?;
        let revision = log.revision + 1;
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.insert(REVISION_KEY, revision).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        self.publish(
            &mut log,
            KvEvent {
                kind: EventKind::Put,
                key: key.to_string(),
                value: value.to_vec(),
                revision,
            },
        );
        debug!(%key, revision, "key stored");
        Ok(revision)
    }

    /// Delete a key. Returns true if it existed.
    ///
    /// Deleting an absent key does not consume a revision.
    pub fn delete(&self, key: &str) -> StateResult<bool> {
        let mut log = self.lock_log()?;
        let revision = log.revision + 1;
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
            if existed {
                let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
                meta.insert(REVISION_KEY, revision).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if existed {
            self.publish(
                &mut log,
                KvEvent {
                    kind: EventKind::Delete,
                    key: key.to_string(),
                    value: Vec::new(),
                    revision,
                },
            );
        }
        debug!(%key, existed, "key deleted");
        Ok(existed)
    }

    /// Delete every key under `prefix`. Returns the number deleted.
    pub fn delete_prefix(&self, prefix: &str) -> StateResult<usize> {
        let mut log = self.lock_log()?;
        let keys: Vec<String> = self
            .read_prefix(prefix)?
            .into_iter()
            .map(|pair| pair.key)
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let first = log.revision + 1;
        let last = log.revision + keys.len() as u64;
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.insert(REVISION_KEY, last).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        for (offset, key) in keys.iter().enumerate() {
            self.publish(
                &mut log,
                KvEvent {
                    kind: EventKind::Delete,
                    key: key.clone(),
                    value: Vec::new(),
                    revision: first + offset as u64,
                },
            );
        }
        debug!(%prefix, deleted = keys.len(), "prefix deleted");
        Ok(keys.len())
    }

    fn publish(&self, log: &mut EventLog, event: KvEvent) {
        log.record(event.clone());
        // No receivers is fine; watchers come and go.
        let _ = self.inner.events.send(event);
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get the value stored under `key`.
    pub fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(guard.value().to_vec())),
            None => Ok(None),
        }
    }

    /// List every pair under `prefix`, with the revision they reflect.
    pub fn list_prefix(&self, prefix: &str) -> StateResult<(Vec<KvPair>, u64)> {
        let log = self.lock_log()?;
        let pairs = self.read_prefix(prefix)?;
        Ok((pairs, log.revision))
    }

    fn read_prefix(&self, prefix: &str) -> StateResult<Vec<KvPair>> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        // Keys are ordered, so everything under `prefix` is contiguous from it.
        for entry in table.range::<&str>(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(KvPair {
                key: key.value().to_string(),
                value: value.value().to_vec(),
            });
        }
        Ok(results)
    }

    // ── Watches ────────────────────────────────────────────────────

    /// Snapshot `prefix` and subscribe to subsequent changes atomically.
    pub fn watch(&self, prefix: &str) -> StateResult<Watch> {
        let log = self.lock_log()?;
        let rx = self.inner.events.subscribe();
        let initial = self.read_prefix(prefix)?;
        Ok(Watch {
            prefix: prefix.to_string(),
            revision: log.revision,
            initial,
            rx,
        })
    }

    /// Events under `prefix` newer than `since`, from the retained history.
    pub fn events_since(&self, prefix: &str, since: u64) -> StateResult<Vec<KvEvent>> {
        self.lock_log()?.since(prefix, since)
    }

    /// Long-poll: wait up to `timeout` for an event under `prefix` newer
    /// than `since`. Returns the current revision and the matching events
    /// (possibly empty on timeout).
    pub async fn wait_for_events(
        &self,
        prefix: &str,
        since: u64,
        timeout: Duration,
    ) -> StateResult<(u64, Vec<KvEvent>)> {
        let mut rx = {
            let log = self.lock_log()?;
            let events = log.since(prefix, since)?;
            if !events.is_empty() {
                return Ok((log.revision, events));
            }
            self.inner.events.subscribe()
        };

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                received = rx.recv() => match received {
                    Ok(event) if event.revision > since && event.key.starts_with(prefix) => break,
                    Ok(_) => continue,
                    // Fall through and serve from history (or report compaction).
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(StateError::Closed),
                },
            }
        }

        let log = self.lock_log()?;
        let events = log.since(prefix, since)?;
        Ok((log.revision, events))
    }

    // ── Cluster configuration ──────────────────────────────────────

    /// Publish the configuration object for `cluster`.
    pub fn set_cluster_config(&self, cluster: &str, config: &ClusterConfig) -> StateResult<u64> {
        let value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        self.put(&keys::cluster_config_key(cluster), &value)
    }

    /// Read the configuration object advertised by `cluster`.
    pub fn get_cluster_config(&self, cluster: &str) -> StateResult<Option<ClusterConfig>> {
        match self.get(&keys::cluster_config_key(cluster))? {
            Some(raw) => {
                let config = serde_json::from_slice(&raw).map_err(map_err!(Deserialize))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }
}

/// Create all tables if they don't exist yet and return the stored revision.
fn ensure_tables(db: &Database) -> StateResult<u64> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    let revision;
    {
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(KV).map_err(map_err!(Table))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        revision = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
    }
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(revision)
}

/// A snapshot of a prefix plus a live feed of subsequent changes.
pub struct Watch {
    prefix: String,
    revision: u64,
    initial: Vec<KvPair>,
    rx: broadcast::Receiver<KvEvent>,
}

impl Watch {
    /// Revision the snapshot reflects (updated as events are consumed).
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Take the initial snapshot. Subsequent calls return an empty list.
    pub fn take_initial(&mut self) -> Vec<KvPair> {
        std::mem::take(&mut self.initial)
    }

    /// Wait for the next change under the watched prefix.
    pub async fn next(&mut self) -> StateResult<KvEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.revision > self.revision && event.key.starts_with(&self.prefix) {
                        self.revision = event.revision;
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Err(StateError::Compacted {
                        requested: self.revision,
                        compacted: self.revision,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return Err(StateError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    #[test]
    fn put_and_get() {
        let store = test_store();
        let rev = store.put("mesh/a", b"one").unwrap();
        assert_eq!(rev, 1);
        assert_eq!(store.get("mesh/a").unwrap().as_deref(), Some(&b"one"[..]));
        assert!(store.get("mesh/b").unwrap().is_none());
    }

    #[test]
    fn revisions_are_monotonic() {
        let store = test_store();
        let r1 = store.put("k1", b"v").unwrap();
        let r2 = store.put("k1", b"v2").unwrap();
        assert!(store.delete("k1").unwrap());
        assert!(r2 > r1);
        assert_eq!(store.revision().unwrap(), r2 + 1);
    }

    #[test]
    fn delete_absent_key_keeps_revision() {
        let store = test_store();
        store.put("k1", b"v").unwrap();
        assert!(!store.delete("missing").unwrap());
        assert_eq!(store.revision().unwrap(), 1);
    }

    #[test]
    fn list_prefix_filters() {
        let store = test_store();
        store.put("mesh/state/nodes/v1/east/a", b"1").unwrap();
        store.put("mesh/state/nodes/v1/east/b", b"2").unwrap();
        store.put("mesh/state/nodes/v1/west/a", b"3").unwrap();

        let (pairs, revision) = store.list_prefix("mesh/state/nodes/v1/east/").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(revision, 3);
    }

    #[test]
    fn list_prefix_stays_within_neighbours() {
        let store = test_store();
        for key in ["a/1", "p", "p/b", "p/a", "p0", "q/1"] {
            store.put(key, key.as_bytes()).unwrap();
        }

        let (pairs, _) = store.list_prefix("p/").unwrap();
        let keys: Vec<&str> = pairs.iter().map(|pair| pair.key.as_str()).collect();
        assert_eq!(keys, ["p/a", "p/b"]);
        assert_eq!(store.list_prefix("").unwrap().0.len(), 6);
        assert!(store.list_prefix("z/").unwrap().0.is_empty());
    }

    #[test]
    fn delete_prefix_removes_all() {
        let store = test_store();
        store.put("p/a", b"1").unwrap();
        store.put("p/b", b"2").unwrap();
        store.put("q/a", b"3").unwrap();

        assert_eq!(store.delete_prefix("p/").unwrap(), 2);
        assert!(store.list_prefix("p/").unwrap().0.is_empty());
        assert_eq!(store.list_prefix("q/").unwrap().0.len(), 1);
        assert_eq!(store.revision().unwrap(), 5);
        assert_eq!(store.delete_prefix("p/").unwrap(), 0);
    }

    #[test]
    fn events_since_returns_matching() {
        let store = test_store();
        store.put("a/1", b"x").unwrap();
        store.put("b/1", b"y").unwrap();
        store.delete("a/1").unwrap();

        let events = store.events_since("a/", 0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Put);
        assert_eq!(events[1].kind, EventKind::Delete);

        let events = store.events_since("a/", 1).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn events_since_reports_compaction() {
        let store = StateStore::open_in_memory_with_history(2).unwrap();
        for i in 0..5 {
            store.put(&format!("k/{i}"), b"v").unwrap();
        }
        let err = store.events_since("k/", 1).unwrap_err();
        assert!(matches!(err, StateError::Compacted { .. }));
        assert_eq!(store.events_since("k/", 3).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn watch_sees_snapshot_then_changes() {
        let store = test_store();
        store.put("w/a", b"1").unwrap();

        let mut watch = store.watch("w/").unwrap();
        let initial = watch.take_initial();
        assert_eq!(initial.len(), 1);
        assert_eq!(watch.revision(), 1);

        store.put("other/x", b"ignored").unwrap();
        store.put("w/b", b"2").unwrap();

        let event = watch.next().await.unwrap();
        assert_eq!(event.key, "w/b");
        assert_eq!(event.kind, EventKind::Put);
        assert_eq!(event.revision, 3);
    }

    #[tokio::test]
    async fn wait_for_events_times_out_empty() {
        let store = test_store();
        let (revision, events) = store
            .wait_for_events("w/", 0, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(revision, 0);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn wait_for_events_wakes_on_write() {
        let store = test_store();
        let writer = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.put("w/a", b"1").unwrap();
        });

        let (revision, events) = store
            .wait_for_events("w/", 0, Duration::from_secs(5))
            .await
            .unwrap();
        handle.await.unwrap();
        assert_eq!(revision, 1);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn cluster_config_round_trip() {
        let store = test_store();
        let config = ClusterConfig {
            id: 9,
            capabilities: ClusterCapabilities {
                synced_canaries: true,
                max_connected_clusters: None,
            },
        };
        store.set_cluster_config("east", &config).unwrap();
        assert_eq!(store.get_cluster_config("east").unwrap(), Some(config));
        assert_eq!(store.get_cluster_config("west").unwrap(), None);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put("mesh/a", b"1").unwrap();
            store.put("mesh/b", b"2").unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.revision().unwrap(), 2);
        assert_eq!(store.get("mesh/b").unwrap().as_deref(), Some(&b"2"[..]));
        // History does not survive a reopen.
        assert!(store.events_since("mesh/", 0).is_err());
        assert!(store.events_since("mesh/", 2).unwrap().is_empty());
    }
}
