//! RedbStore — the revisioned key/value store on top of redb.
//!
//! All entries share one table. A commit opens a single redb write
//! transaction, checks the compares, applies the ops under `revision + 1`,
//! and only after the redb commit succeeds hands the changes to watchers.
//! Commits and watch registration serialize on one mutex, so every
//! watcher observes the snapshot-then-batches sequence in revision order
//! with no gaps.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{StoreError, StoreResult};
use crate::kv::{
    KvEntry, KvStore, LeaseId, TxnOp, TxnRequest, WatchEvent, WatchMessage, WatchReceiver,
};
use crate::tables::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    ttl_ms: u64,
    expires_at_ms: u64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchMessage>,
}

#[derive(Default)]
struct Watchers {
    subs: Vec<Watcher>,
}

impl Watchers {
    /// Deliver one commit to every live watcher, dropping closed ones.
    fn dispatch(&mut self, rev: u64, events: &[WatchEvent]) {
        self.subs.retain(|w| {
            let events = events
                .iter()
                .filter(|e| e.key.starts_with(&w.prefix))
                .cloned()
                .collect();
            w.tx.send(WatchMessage::Batch { rev, events }).is_ok()
        });
    }
}

/// Result of applying a transaction inside a redb write transaction.
enum Applied {
    /// Compares held but there was nothing to write.
    NoOp(u64),
    Committed(u64, Vec<WatchEvent>),
}

/// Thread-safe store backed by redb.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    watchers: Arc<Mutex<Watchers>>,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            watchers: Arc::new(Mutex::new(Watchers::default())),
        }
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(KV).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn lock_watchers(&self) -> MutexGuard<'_, Watchers> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(wtx: &WriteTransaction, txn: TxnRequest) -> StoreResult<Applied> {
        let mut kv = wtx.open_table(KV).map_err(map_err!(Table))?;
        let mut meta = wtx.open_table(META).map_err(map_err!(Table))?;
        let leases = wtx.open_table(LEASES).map_err(map_err!(Table))?;

        let current = read_counter(&meta, REVISION)?;
        for cmp in &txn.compares {
            let entry = read_entry(&kv, cmp.key())?;
            if !cmp.holds(entry.as_ref()) {
                trace!(key = cmp.key(), ?cmp, "compare failed");
                return Err(StoreError::Conflict);
            }
        }
        if txn.ops.is_empty() {
            return Ok(Applied::NoOp(current));
        }

        let rev = current + 1;
        let mut events = Vec::with_capacity(txn.ops.len());
        for op in txn.ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    if let Some(id) = lease {
                        if leases.get(id).map_err(map_err!(Read))?.is_none() {
                            return Err(StoreError::LeaseNotFound(id));
                        }
                    }
                    let prev = read_entry(&kv, &key)?;
                    let entry = KvEntry {
                        value,
                        version: prev.as_ref().map_or(1, |p| p.version + 1),
                        create_rev: prev.as_ref().map_or(rev, |p| p.create_rev),
                        mod_rev: rev,
                        lease,
                    };
                    write_entry(&mut kv, &key, &entry)?;
                    events.push(WatchEvent::put(key, entry));
                }
                TxnOp::Delete { key } => {
                    if kv.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                        events.push(WatchEvent::delete(key, rev));
                    }
                }
            }
        }
        meta.insert(REVISION, rev).map_err(map_err!(Write))?;
        Ok(Applied::Committed(rev, events))
    }

    /// Remove leases and their keys in one revision. Unless `force` is set,
    /// only leases that are still past their deadline are removed.
    fn remove_leases(&self, ids: &[LeaseId], force: bool) -> StoreResult<usize> {
        let mut watchers = self.lock_watchers();
        let now = now_ms();
        let wtx = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (removed, rev, events) = {
            let mut leases = wtx.open_table(LEASES).map_err(map_err!(Table))?;
            let mut kv = wtx.open_table(KV).map_err(map_err!(Table))?;
            let mut meta = wtx.open_table(META).map_err(map_err!(Table))?;

            let mut dropped = Vec::new();
            for &id in ids {
                let record = match leases.get(id).map_err(map_err!(Read))? {
                    Some(guard) => decode_lease(guard.value())?,
                    None if force => return Err(StoreError::LeaseNotFound(id)),
                    None => continue,
                };
                if force || record.expires_at_ms <= now {
                    dropped.push(id);
                }
            }
            for id in &dropped {
                leases.remove(*id).map_err(map_err!(Write))?;
            }

            let mut doomed = Vec::new();
            for item in kv.iter().map_err(map_err!(Read))? {
                let (key, value) = item.map_err(map_err!(Read))?;
                let entry = decode_entry(value.value())?;
                if entry.lease.is_some_and(|l| dropped.contains(&l)) {
                    doomed.push(key.value().to_string());
                }
            }

            let rev = read_counter(&meta, REVISION)? + 1;
            let mut events = Vec::with_capacity(doomed.len());
            for key in doomed {
                kv.remove(key.as_str()).map_err(map_err!(Write))?;
                events.push(WatchEvent::delete(key, rev));
            }
            if !events.is_empty() {
                meta.insert(REVISION, rev).map_err(map_err!(Write))?;
            }
            (dropped.len(), rev, events)
        };
        wtx.commit().map_err(map_err!(Transaction))?;

        if !events.is_empty() {
            debug!(rev, keys = events.len(), "lease-bound keys removed");
            watchers.dispatch(rev, &events);
        }
        Ok(removed)
    }
}

impl KvStore for RedbStore {
    fn get(&self, key: &str) -> StoreResult<Option<KvEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        read_entry(&table, key)
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<(String, KvEntry)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for item in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = item.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_string(), decode_entry(value.value())?));
        }
        Ok(results)
    }

    fn revision(&self) -> StoreResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        read_counter(&meta, REVISION)
    }

    fn commit(&self, txn: TxnRequest) -> StoreResult<u64> {
        let mut watchers = self.lock_watchers();
        let wtx = self.db.begin_write().map_err(map_err!(Transaction))?;
        match Self::apply(&wtx, txn) {
            Ok(Applied::Committed(rev, events)) => {
                wtx.commit().map_err(map_err!(Transaction))?;
                trace!(rev, changes = events.len(), "committed");
                watchers.dispatch(rev, &events);
                Ok(rev)
            }
            Ok(Applied::NoOp(rev)) => {
                wtx.abort().map_err(map_err!(Transaction))?;
                Ok(rev)
            }
            Err(e) => {
                wtx.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    fn watch(&self, prefix: &str) -> StoreResult<WatchReceiver> {
        let mut watchers = self.lock_watchers();
        let rev = self.revision()?;
        let entries = self.list(prefix)?;
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is still in hand, so this send cannot fail.
        let _ = tx.send(WatchMessage::Snapshot { rev, entries });
        watchers.subs.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        debug!(%prefix, rev, "watch registered");
        Ok(rx)
    }

    fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let record = LeaseRecord {
            ttl_ms,
            expires_at_ms: now_ms().saturating_add(ttl_ms),
        };
        let wtx = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = {
            let mut meta = wtx.open_table(META).map_err(map_err!(Table))?;
            let mut leases = wtx.open_table(LEASES).map_err(map_err!(Table))?;
            let id = read_counter(&meta, LEASE_SEQ)? + 1;
            meta.insert(LEASE_SEQ, id).map_err(map_err!(Write))?;
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            leases.insert(id, value.as_slice()).map_err(map_err!(Write))?;
            id
        };
        wtx.commit().map_err(map_err!(Transaction))?;
        debug!(lease = id, ttl_ms, "lease granted");
        Ok(id)
    }

    fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        let wtx = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut leases = wtx.open_table(LEASES).map_err(map_err!(Table))?;
            let mut record = match leases.get(lease).map_err(map_err!(Read))? {
                Some(guard) => decode_lease(guard.value())?,
                None => return Err(StoreError::LeaseNotFound(lease)),
            };
            record.expires_at_ms = now_ms().saturating_add(record.ttl_ms);
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            leases.insert(lease, value.as_slice()).map_err(map_err!(Write))?;
        }
        wtx.commit().map_err(map_err!(Transaction))?;
        trace!(lease, "lease renewed");
        Ok(())
    }

    fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.remove_leases(&[lease], true)?;
        debug!(lease, "lease revoked");
        Ok(())
    }

    fn expire_leases(&self) -> StoreResult<usize> {
        let now = now_ms();
        let expired = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for item in leases.iter().map_err(map_err!(Read))? {
                let (id, value) = item.map_err(map_err!(Read))?;
                if decode_lease(value.value())?.expires_at_ms <= now {
                    expired.push(id.value());
                }
            }
            expired
        };
        if expired.is_empty() {
            return Ok(0);
        }
        self.remove_leases(&expired, false)
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn read_entry<T>(table: &T, key: &str) -> StoreResult<Option<KvEntry>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode_entry(guard.value())?)),
        None => Ok(None),
    }
}

fn write_entry(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    entry: &KvEntry,
) -> StoreResult<()> {
    let value = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
    table
        .insert(key, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn read_counter<T>(table: &T, name: &str) -> StoreResult<u64>
where
    T: ReadableTable<&'static str, u64>,
{
    Ok(table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0))
}

fn decode_entry(bytes: &[u8]) -> StoreResult<KvEntry> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn decode_lease(bytes: &[u8]) -> StoreResult<LeaseRecord> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Compare, EventKind};

    fn test_store() -> RedbStore {
        RedbStore::open_in_memory().unwrap()
    }

    #[test]
    fn create_get_and_duplicate() {
        let store = test_store();
        let rev = store.create("1/010/a", "one").unwrap();
        assert_eq!(rev, 1);

        let entry = store.get("1/010/a").unwrap().unwrap();
        assert_eq!(entry.value, "one");
        assert_eq!(entry.version, 1);
        assert_eq!(entry.create_rev, 1);
        assert_eq!(entry.mod_rev, 1);

        assert!(matches!(
            store.create("1/010/a", "two"),
            Err(StoreError::KeyExists(_))
        ));
        assert_eq!(store.revision().unwrap(), 1);
    }

    #[test]
    fn update_by_version() {
        let store = test_store();
        store.create("k", "v1").unwrap();
        store.update("k", "v2", 1).unwrap();

        let entry = store.get("k").unwrap().unwrap();
        assert_eq!(entry.value, "v2");
        assert_eq!(entry.version, 2);
        assert_eq!(entry.create_rev, 1);
        assert_eq!(entry.mod_rev, 2);

        assert!(matches!(
            store.update("k", "v3", 1),
            Err(StoreError::VersionMismatch(_))
        ));
        assert!(matches!(
            store.update("missing", "v", 1),
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn list_is_prefix_scoped_and_ordered() {
        let store = test_store();
        store.put("1/040/b", "b", None).unwrap();
        store.put("1/040/a", "a", None).unwrap();
        store.put("1/050/c", "c", None).unwrap();
        store.put("2/040/d", "d", None).unwrap();

        let keys: Vec<_> = store
            .list("1/040/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["1/040/a", "1/040/b"]);
    }

    #[test]
    fn delete_missing_key_still_commits() {
        let store = test_store();
        store.put("k", "v", None).unwrap();
        store.delete("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
        // Deleting again bumps the revision without producing an event.
        assert_eq!(store.delete("k").unwrap(), 3);
    }

    #[test]
    fn failed_compare_writes_nothing() {
        let store = test_store();
        store.put("a", "1", None).unwrap();
        let txn = TxnRequest {
            compares: vec![Compare::ModRev {
                key: "a".to_string(),
                rev: 99,
            }],
            ops: vec![TxnOp::Put {
                key: "b".to_string(),
                value: "2".to_string(),
                lease: None,
            }],
        };
        assert!(matches!(store.commit(txn), Err(StoreError::Conflict)));
        assert!(store.get("b").unwrap().is_none());
        assert_eq!(store.revision().unwrap(), 1);
    }

    #[test]
    fn multi_key_commit_is_one_revision() {
        let store = test_store();
        let txn = TxnRequest {
            compares: vec![Compare::ModRevAtMost {
                key: "a".to_string(),
                rev: 0,
            }],
            ops: vec![
                TxnOp::Put {
                    key: "a".to_string(),
                    value: "1".to_string(),
                    lease: None,
                },
                TxnOp::Put {
                    key: "b".to_string(),
                    value: "2".to_string(),
                    lease: None,
                },
            ],
        };
        let rev = store.commit(txn).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().mod_rev, rev);
        assert_eq!(store.get("b").unwrap().unwrap().mod_rev, rev);
    }

    #[tokio::test]
    async fn watch_sends_snapshot_then_batches() {
        let store = test_store();
        store.put("1/010/a", "a", None).unwrap();

        let mut rx = store.watch("1/").unwrap();
        match rx.recv().await.unwrap() {
            WatchMessage::Snapshot { rev, entries } => {
                assert_eq!(rev, 1);
                assert_eq!(entries.len(), 1);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        store.put("1/010/b", "b", None).unwrap();
        store.put("9/010/x", "x", None).unwrap();
        store.delete("1/010/a").unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.rev(), 2);
        let WatchMessage::Batch { events, .. } = first else {
            panic!("expected batch");
        };
        assert_eq!(events[0].kind, EventKind::Put);
        assert_eq!(events[0].key, "1/010/b");

        // Out-of-prefix commits arrive as empty batches.
        let second = rx.recv().await.unwrap();
        assert_eq!(second, WatchMessage::Batch { rev: 3, events: vec![] });

        let third = rx.recv().await.unwrap();
        let WatchMessage::Batch { rev, events } = third else {
            panic!("expected batch");
        };
        assert_eq!(rev, 4);
        assert_eq!(events[0].kind, EventKind::Delete);
    }

    #[test]
    fn lease_revoke_removes_bound_keys() {
        let store = test_store();
        let lease = store.grant(Duration::from_secs(60)).unwrap();
        store.put("s/1", "x", Some(lease)).unwrap();
        store.put("s/2", "y", None).unwrap();

        store.keep_alive(lease).unwrap();
        store.revoke(lease).unwrap();
        assert!(store.get("s/1").unwrap().is_none());
        assert!(store.get("s/2").unwrap().is_some());
        assert!(matches!(
            store.keep_alive(lease),
            Err(StoreError::LeaseNotFound(_))
        ));
    }

    #[test]
    fn put_with_unknown_lease_fails() {
        let store = test_store();
        assert!(matches!(
            store.put("k", "v", Some(42)),
            Err(StoreError::LeaseNotFound(42))
        ));
    }

    #[test]
    fn expired_leases_are_reaped() {
        let store = test_store();
        let short = store.grant(Duration::from_millis(0)).unwrap();
        let long = store.grant(Duration::from_secs(60)).unwrap();
        store.put("a", "1", Some(short)).unwrap();
        store.put("b", "2", Some(long)).unwrap();

        assert_eq!(store.expire_leases().unwrap(), 1);
        assert!(store.get("a").unwrap().is_none());
        assert!(store.get("b").unwrap().is_some());
        assert_eq!(store.expire_leases().unwrap(), 0);
    }

    #[test]
    fn persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edgegrid.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            store.put("1/010/a", "persisted", None).unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get("1/010/a").unwrap().unwrap().value, "persisted");
        assert_eq!(store.revision().unwrap(), 1);
    }
}
