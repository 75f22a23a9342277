//! Test harness that makes every transaction retry at least once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::trace;

use crate::error::{StoreError, StoreResult};
use crate::kv::{KvEntry, KvStore, LeaseId, TxnRequest, WatchReceiver};

/// Wraps a store and fails the first commit of each distinct transaction
/// with [`StoreError::Conflict`].
///
/// A retried transaction function that is pure rebuilds the same request,
/// which then goes through. A function that leaks state between attempts
/// produces a different request or a different final object, which tests
/// can detect. Single-key helpers (`create`, `put`, ...) are passed
/// straight through.
pub struct ConflictInjector<S> {
    inner: S,
    seen: Mutex<HashSet<String>>,
    injected: AtomicU64,
}

impl<S: KvStore> ConflictInjector<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            seen: Mutex::new(HashSet::new()),
            injected: AtomicU64::new(0),
        }
    }

    /// Number of conflicts injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: KvStore> KvStore for ConflictInjector<S> {
    fn get(&self, key: &str) -> StoreResult<Option<KvEntry>> {
        self.inner.get(key)
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<(String, KvEntry)>> {
        self.inner.list(prefix)
    }

    fn revision(&self) -> StoreResult<u64> {
        self.inner.revision()
    }

    fn commit(&self, txn: TxnRequest) -> StoreResult<u64> {
        if !txn.ops.is_empty() {
            let fingerprint = format!("{:?}", txn.ops);
            let first = self
                .seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(fingerprint);
            if first {
                self.injected.fetch_add(1, Ordering::SeqCst);
                trace!(ops = txn.ops.len(), "injecting conflict");
                return Err(StoreError::Conflict);
            }
        }
        self.inner.commit(txn)
    }

    fn watch(&self, prefix: &str) -> StoreResult<WatchReceiver> {
        self.inner.watch(prefix)
    }

    fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        self.inner.grant(ttl)
    }

    fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        self.inner.keep_alive(lease)
    }

    fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.inner.revoke(lease)
    }

    fn expire_leases(&self) -> StoreResult<usize> {
        self.inner.expire_leases()
    }

    fn create(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.inner.create(key, value)
    }

    fn update(&self, key: &str, value: &str, version: i64) -> StoreResult<u64> {
        self.inner.update(key, value, version)
    }

    fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<u64> {
        self.inner.put(key, value, lease)
    }

    fn delete(&self, key: &str) -> StoreResult<u64> {
        self.inner.delete(key)
    }
}
