//! SyncEngine — applies committed revisions to the registered caches and
//! gives transactions their read-your-writes barrier.
//!
//! A single watcher task consumes the store's watch stream for the
//! region. The initial snapshot is replayed cache by cache in
//! registration order; each later commit arrives as one batch whose events
//! are likewise applied in registration order, so parents (e.g. refs) are
//! always visible before the children that depend on them. After every
//! message the engine publishes the revision it has reached.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use edgegrid_core::StoredObject;
use edgegrid_store::keys::{parse_db_key, region_prefix};
use edgegrid_store::{
    EventKind, KvStore, LeaseId, Stm, StmConfig, StoreError, StoreResult, WatchMessage,
    WatchReceiver, apply_stm,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{ObjectCache, SyncCache};
use crate::error::SyncResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Reached {
    rev: u64,
    stopped: bool,
}

pub struct SyncEngine {
    store: Arc<dyn KvStore>,
    region: u32,
    stm_config: StmConfig,
    caches: Mutex<Vec<Arc<dyn SyncCache>>>,
    reached: watch::Sender<Reached>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn KvStore>, region: u32, stm_config: StmConfig) -> Arc<Self> {
        let (reached, _) = watch::channel(Reached::default());
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            store,
            region,
            stm_config,
            caches: Mutex::new(Vec::new()),
            reached,
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn region(&self) -> u32 {
        self.region
    }

    fn caches(&self) -> MutexGuard<'_, Vec<Arc<dyn SyncCache>>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a cache. Registration order is the replay order, so
    /// register parent types before the types that reference them, and
    /// register everything before [`SyncEngine::start`].
    pub fn register<T: StoredObject>(&self, cache: &ObjectCache<T>) {
        let mut caches = self.caches();
        if caches.iter().any(|c| c.type_tag() == T::TYPE_TAG) {
            warn!(kind = T::TYPE_NAME, "cache already registered");
            return;
        }
        caches.push(Arc::new(cache.clone()));
        debug!(kind = T::TYPE_NAME, order = caches.len(), "cache registered");
    }

    /// Type names in replay order.
    pub fn registered(&self) -> Vec<&'static str> {
        self.caches().iter().map(|c| c.type_name()).collect()
    }

    /// Load the current store contents into the caches, then follow the
    /// store in the background.
    pub async fn start(self: &Arc<Self>) -> SyncResult<()> {
        let mut rx = self.store.watch(&region_prefix(self.region))?;
        if let Some(snapshot) = rx.recv().await {
            self.apply(snapshot);
        }

        let engine = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move { engine.follow(rx, shutdown).await });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(region = self.region, rev = self.revision(), "sync started");
        Ok(())
    }

    async fn follow(&self, mut rx: WatchReceiver, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.apply(msg),
                    None => {
                        warn!("store watch closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    debug!("sync watcher shutting down");
                    break;
                }
            }
        }
        self.reached.send_modify(|r| r.stopped = true);
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.reached.send_modify(|r| r.stopped = true);
    }

    fn apply(&self, msg: WatchMessage) {
        let caches: Vec<Arc<dyn SyncCache>> = self.caches().clone();
        let rev = msg.rev();
        match msg {
            WatchMessage::Snapshot { entries, .. } => {
                debug!(rev, entries = entries.len(), "applying snapshot");
                for cache in &caches {
                    cache.sync_list_start();
                    for (key, entry) in &entries {
                        if let Some((_, tag, id)) = parse_db_key(key) {
                            if tag == cache.type_tag() {
                                cache.sync_update(id, &entry.value, entry.mod_rev);
                            }
                        }
                    }
                    cache.sync_list_end();
                }
            }
            WatchMessage::Batch { events, .. } => {
                trace!(rev, events = events.len(), "applying batch");
                for cache in &caches {
                    for event in &events {
                        let Some((_, tag, id)) = parse_db_key(&event.key) else {
                            continue;
                        };
                        if tag != cache.type_tag() {
                            continue;
                        }
                        match (event.kind, &event.entry) {
                            (EventKind::Put, Some(entry)) => {
                                cache.sync_update(id, &entry.value, entry.mod_rev)
                            }
                            _ => cache.sync_delete(id, event.mod_rev),
                        }
                    }
                }
            }
        }
        self.reached.send_modify(|r| r.rev = r.rev.max(rev));
    }

    /// Highest revision applied to the caches.
    pub fn revision(&self) -> u64 {
        self.reached.borrow().rev
    }

    /// Wait until the caches reflect revision `rev`. Returns early if the
    /// engine stops.
    pub async fn sync_wait(&self, rev: u64) {
        let mut rx = self.reached.subscribe();
        let reached = rx.wait_for(|r| r.rev >= rev || r.stopped).await;
        if let Ok(r) = reached {
            if r.rev < rev {
                warn!(rev, reached = r.rev, "sync stopped before revision was applied");
            }
        }
    }

    /// Run `apply` as an STM transaction and wait until the local caches
    /// reflect the commit. Errors from `apply` are returned unchanged.
    pub async fn apply_stm_wait<F, E>(&self, apply: F) -> Result<u64, E>
    where
        F: FnMut(&mut Stm<'_>) -> Result<(), E>,
        E: From<StoreError>,
    {
        let rev = apply_stm(self.store.as_ref(), self.region, &self.stm_config, apply).await?;
        self.sync_wait(rev).await;
        Ok(rev)
    }

    pub fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        self.store.grant(ttl)
    }

    pub fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.store.revoke(lease)
    }

    /// Renew `lease` every `interval` until the returned handle is stopped
    /// or dropped.
    pub fn spawn_keep_alive(&self, lease: LeaseId, interval: Duration) -> KeepAlive {
        let (shutdown, mut stop) = watch::channel(false);
        let store = Arc::clone(&self.store);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = store.keep_alive(lease) {
                            warn!(lease, error = %e, "lease keep-alive failed");
                            break;
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            trace!(lease, "keep-alive finished");
        });
        KeepAlive { shutdown, handle }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle of a running lease keep-alive task.
pub struct KeepAlive {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        let _ = (&mut self.handle).await;
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
