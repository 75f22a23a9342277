//! ObjectCache — the in-memory replica of one resource type.
//!
//! All state sits behind a single mutex. Mutations never call out while
//! holding it: interested key watchers are collected under the lock and
//! signalled after it is released, and each watcher's callback runs on
//! its own task. Callbacks are therefore free to read the cache again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use edgegrid_core::{NotifyTagged, ObjKey, StoredObject};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::filter;

/// Change notification delivered to [`ObjectCache::subscribe`] streams.
///
/// `mod_rev` is the store revision of the change. Local-only changes and
/// removals during a resync or flush carry 0.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent<T> {
    Updated { obj: T, old: Option<T>, mod_rev: u64 },
    Deleted { old: T, mod_rev: u64 },
}

struct Entry<T> {
    obj: T,
    mod_rev: u64,
    list_gen: u64,
}

struct KeyWatcher {
    id: u64,
    tx: mpsc::UnboundedSender<()>,
}

struct Inner<T: StoredObject> {
    objs: BTreeMap<T::Key, Entry<T>>,
    watchers: HashMap<T::Key, Vec<KeyWatcher>>,
    subscribers: Vec<mpsc::UnboundedSender<CacheEvent<T>>>,
    next_watch_id: u64,
    list_gen: u64,
    /// Highest store revision applied.
    rev: u64,
}

impl<T: StoredObject> Inner<T> {
    fn signals(&self, key: &T::Key) -> Vec<mpsc::UnboundedSender<()>> {
        self.watchers
            .get(key)
            .map(|ws| ws.iter().map(|w| w.tx.clone()).collect())
            .unwrap_or_default()
    }

    /// Subscribers are fed under the lock so they see mutations in order;
    /// an unbounded send never blocks.
    fn publish(&mut self, event: CacheEvent<T>) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Shared, cloneable cache of every object of type `T`.
pub struct ObjectCache<T: StoredObject> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: StoredObject> Clone for ObjectCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: StoredObject> Default for ObjectCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StoredObject> ObjectCache<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objs: BTreeMap::new(),
                watchers: HashMap::new(),
                subscribers: Vec::new(),
                next_watch_id: 1,
                list_gen: 0,
                rev: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get(&self, key: &T::Key) -> Option<T> {
        self.lock().objs.get(key).map(|e| e.obj.clone())
    }

    /// The object together with the store revision that last wrote it.
    pub fn get_with_rev(&self, key: &T::Key) -> Option<(T, u64)> {
        self.lock()
            .objs
            .get(key)
            .map(|e| (e.obj.clone(), e.mod_rev))
    }

    pub fn has_key(&self, key: &T::Key) -> bool {
        self.lock().objs.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.lock().objs.len()
    }

    pub fn keys(&self) -> Vec<T::Key> {
        self.lock().objs.keys().cloned().collect()
    }

    /// All objects, ordered by key.
    pub fn list(&self) -> Vec<T> {
        self.lock().objs.values().map(|e| e.obj.clone()).collect()
    }

    /// Visit every object matching `filter` from a point-in-time snapshot.
    /// Fields of `filter` left at their default value match anything.
    /// Returns the number of objects visited.
    pub fn show<E>(
        &self,
        filter: &T,
        mut visit: impl FnMut(&T) -> Result<(), E>,
    ) -> Result<usize, E> {
        let snapshot = self.list();
        let want = serde_json::to_value(filter).unwrap_or(Value::Null);
        let default = serde_json::to_value(T::default()).unwrap_or(Value::Null);
        let mut visited = 0;
        for obj in &snapshot {
            let have = serde_json::to_value(obj).unwrap_or(Value::Null);
            if filter::matches(&want, &default, &have) {
                visit(obj)?;
                visited += 1;
            }
        }
        Ok(visited)
    }

    /// Objects matching a predicate, from a point-in-time snapshot.
    pub fn filtered(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        self.lock()
            .objs
            .values()
            .filter(|e| pred(&e.obj))
            .map(|e| e.obj.clone())
            .collect()
    }

    /// Like [`ObjectCache::filtered`], plus the highest store revision the
    /// result reflects. Every change published afterwards carries a
    /// higher revision, or 0.
    pub fn filtered_at_rev(&self, mut pred: impl FnMut(&T) -> bool) -> (Vec<T>, u64) {
        let inner = self.lock();
        let objs = inner
            .objs
            .values()
            .filter(|e| pred(&e.obj))
            .map(|e| e.obj.clone())
            .collect();
        (objs, inner.rev)
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Store `obj` as written at `mod_rev`. Updates older than the cached
    /// revision are dropped, so the cache never moves backwards. Local-only
    /// caches pass 0.
    pub fn update(&self, obj: T, mod_rev: u64) {
        let key = obj.key().clone();
        let signals = {
            let mut inner = self.lock();
            if let Some(existing) = inner.objs.get(&key) {
                if mod_rev != 0 && existing.mod_rev > mod_rev {
                    trace!(kind = T::TYPE_NAME, %key, mod_rev, "stale update dropped");
                    return;
                }
            }
            let list_gen = inner.list_gen;
            inner.rev = inner.rev.max(mod_rev);
            let old = inner
                .objs
                .insert(
                    key.clone(),
                    Entry {
                        obj: obj.clone(),
                        mod_rev,
                        list_gen,
                    },
                )
                .map(|e| e.obj);
            inner.publish(CacheEvent::Updated { obj, old, mod_rev });
            inner.signals(&key)
        };
        notify(signals);
    }

    pub fn delete(&self, key: &T::Key, mod_rev: u64) {
        let signals = {
            let mut inner = self.lock();
            let Some(old) = inner.objs.remove(key) else {
                return;
            };
            trace!(kind = T::TYPE_NAME, %key, mod_rev, "deleted");
            inner.rev = inner.rev.max(mod_rev);
            inner.publish(CacheEvent::Deleted {
                old: old.obj,
                mod_rev,
            });
            inner.signals(key)
        };
        notify(signals);
    }

    /// Start a full resync: entries not refreshed before
    /// [`ObjectCache::list_end`] are removed.
    pub fn list_start(&self) {
        self.lock().list_gen += 1;
    }

    pub fn list_end(&self) {
        let signals = {
            let mut inner = self.lock();
            let current = inner.list_gen;
            let stale: Vec<T::Key> = inner
                .objs
                .iter()
                .filter(|(_, e)| e.list_gen < current)
                .map(|(k, _)| k.clone())
                .collect();
            let mut signals = Vec::new();
            for key in stale {
                if let Some(old) = inner.objs.remove(&key) {
                    debug!(kind = T::TYPE_NAME, %key, "removed during resync");
                    inner.publish(CacheEvent::Deleted {
                        old: old.obj,
                        mod_rev: 0,
                    });
                    signals.extend(inner.signals(&key));
                }
            }
            signals
        };
        notify(signals);
    }

    // ── Watches ────────────────────────────────────────────────────

    /// Run `callback` on a private task each time the object at `key`
    /// changes, until the returned guard is dropped or cancelled.
    /// Must be called within a tokio runtime.
    pub fn watch_key<F>(&self, key: &T::Key, mut callback: F) -> KeyWatch
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let id = {
            let mut inner = self.lock();
            let id = inner.next_watch_id;
            inner.next_watch_id += 1;
            inner
                .watchers
                .entry(key.clone())
                .or_default()
                .push(KeyWatcher { id, tx });
            id
        };
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                callback();
            }
        });

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        let key = key.clone();
        KeyWatch {
            cancel: Some(Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(list) = inner.watchers.get_mut(&key) {
                    list.retain(|w| w.id != id);
                    if list.is_empty() {
                        inner.watchers.remove(&key);
                    }
                }
            })),
        }
    }

    /// Number of registered key watches, across all keys.
    pub fn watch_count(&self) -> usize {
        self.lock().watchers.values().map(Vec::len).sum()
    }

    /// Stream of every subsequent mutation, in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CacheEvent<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Block until `pred` holds for the object at `key` (`None` when
    /// absent), or fail after `timeout`. Returns the object at that point.
    pub async fn wait_for<P>(
        &self,
        key: &T::Key,
        timeout: Duration,
        mut pred: P,
    ) -> SyncResult<Option<T>>
    where
        P: FnMut(Option<&T>) -> bool,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watch = self.watch_key(key, move || {
            let _ = tx.send(());
        });
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.get(key);
            if pred(current.as_ref()) {
                return Ok(current);
            }
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(())) => {}
                Ok(None) | Err(_) => return Err(SyncError::WaitTimeout(key.to_string())),
            }
        }
    }
}

impl<T: StoredObject + NotifyTagged> ObjectCache<T> {
    /// Remove every object last written by agent connection `notify_id`.
    pub fn flush(&self, notify_id: u64) -> usize {
        let signals = {
            let mut inner = self.lock();
            let doomed: Vec<T::Key> = inner
                .objs
                .iter()
                .filter(|(_, e)| e.obj.notify_id() == notify_id)
                .map(|(k, _)| k.clone())
                .collect();
            let mut signals = Vec::new();
            for key in doomed {
                if let Some(old) = inner.objs.remove(&key) {
                    inner.publish(CacheEvent::Deleted {
                        old: old.obj,
                        mod_rev: 0,
                    });
                    signals.extend(inner.signals(&key));
                }
            }
            signals
        };
        let flushed = signals.len();
        notify(signals);
        flushed
    }
}

fn notify(signals: Vec<mpsc::UnboundedSender<()>>) {
    for tx in signals {
        let _ = tx.send(());
    }
}

/// Registration handle for a key watch. Dropping it unregisters the
/// callback and lets its task finish.
pub struct KeyWatch {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl KeyWatch {
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for KeyWatch {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Type-erased view of a cache used by the sync engine.
pub trait SyncCache: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn type_tag(&self) -> u16;
    fn sync_list_start(&self);
    /// Apply a stored value; `id` is the key part of the store key.
    fn sync_update(&self, id: &str, value: &str, mod_rev: u64);
    fn sync_delete(&self, id: &str, mod_rev: u64);
    fn sync_list_end(&self);
}

impl<T: StoredObject> SyncCache for ObjectCache<T> {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn type_tag(&self) -> u16 {
        T::TYPE_TAG
    }

    fn sync_list_start(&self) {
        self.list_start();
    }

    fn sync_update(&self, id: &str, value: &str, mod_rev: u64) {
        match serde_json::from_str::<T>(value) {
            Ok(obj) => self.update(obj, mod_rev),
            Err(e) => warn!(kind = T::TYPE_NAME, %id, error = %e, "undecodable value skipped"),
        }
    }

    fn sync_delete(&self, id: &str, mod_rev: u64) {
        match T::Key::from_key_string(id) {
            Ok(key) => self.delete(&key, mod_rev),
            Err(e) => warn!(kind = T::TYPE_NAME, %id, error = %e, "undecodable key skipped"),
        }
    }

    fn sync_list_end(&self) {
        self.list_end();
    }
}
