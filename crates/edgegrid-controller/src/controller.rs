//! The controller service handle and its caches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use edgegrid_core::{
    App, AppInst, AppInstInfo, Cloudlet, CloudletInfo, CloudletRefs, ClusterInst,
    ClusterInstInfo, ControllerConfig, Flavor, StreamObj, Timeouts, TrackedState,
};
use edgegrid_sync::{ObjectCache, SyncEngine};
use tracing::debug;

/// Tunables the lifecycle code needs at run time.
#[derive(Debug, Clone)]
pub struct Settings {
    pub timeouts: Timeouts,
    /// DNS suffix for generated instance URIs.
    pub app_dns_root: String,
    pub stream_ttl: Duration,
    pub keep_alive_interval: Duration,
}

impl Settings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            timeouts: config.timeouts(),
            app_dns_root: config.app_dns_root.clone(),
            stream_ttl: Duration::from_secs(config.leases.stream_ttl_secs),
            keep_alive_interval: Duration::from_millis(config.leases.keep_alive_interval_ms),
        }
    }
}

/// One cache per object type. The info caches hold the agent's last
/// report per connection and are never persisted.
#[derive(Default)]
pub struct Caches {
    pub flavor: ObjectCache<Flavor>,
    pub cloudlet: ObjectCache<Cloudlet>,
    pub cloudlet_info: ObjectCache<CloudletInfo>,
    pub cloudlet_refs: ObjectCache<CloudletRefs>,
    pub app: ObjectCache<App>,
    pub cluster_inst: ObjectCache<ClusterInst>,
    pub app_inst: ObjectCache<AppInst>,
    pub stream_obj: ObjectCache<StreamObj>,
    pub cluster_inst_info: ObjectCache<ClusterInstInfo>,
    pub app_inst_info: ObjectCache<AppInstInfo>,
}

struct Inner {
    sync: Arc<SyncEngine>,
    settings: Settings,
    caches: Caches,
    ignored_transitions: AtomicU64,
    ignored_by_key: Mutex<HashMap<String, (TrackedState, u32)>>,
}

/// Cheap-to-clone handle to the controller's state. All lifecycle
/// operations hang off this type.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Build the caches and register them with `sync`. Must run before
    /// the engine is started.
    pub fn new(sync: Arc<SyncEngine>, settings: Settings) -> Self {
        let caches = Caches::default();
        // Parents before children: replay never shows a child whose
        // parent is missing from its cache.
        sync.register(&caches.flavor);
        sync.register(&caches.cloudlet);
        sync.register(&caches.cloudlet_info);
        sync.register(&caches.cloudlet_refs);
        sync.register(&caches.app);
        sync.register(&caches.cluster_inst);
        sync.register(&caches.app_inst);
        sync.register(&caches.stream_obj);
        debug!(types = ?sync.registered(), "controller caches registered");

        Self {
            inner: Arc::new(Inner {
                sync,
                settings,
                caches,
                ignored_transitions: AtomicU64::new(0),
                ignored_by_key: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.inner.sync
    }

    pub fn caches(&self) -> &Caches {
        &self.inner.caches
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Number of agent reports dropped as illegal transitions.
    pub fn ignored_transitions(&self) -> u64 {
        self.inner.ignored_transitions.load(Ordering::Relaxed)
    }

    /// Count a dropped report; returns how often this key has reported
    /// the same target state in a row.
    pub(crate) fn record_ignored(&self, id: String, to: TrackedState) -> u32 {
        self.inner.ignored_transitions.fetch_add(1, Ordering::Relaxed);
        let mut by_key = self
            .inner
            .ignored_by_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = by_key.entry(id).or_insert((to, 0));
        if entry.0 != to {
            *entry = (to, 0);
        }
        entry.1 += 1;
        entry.1
    }

    pub(crate) fn forget_ignored(&self, id: &str) {
        self.inner
            .ignored_by_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    #[cfg(test)]
    pub(crate) fn tracked_ignored_keys(&self) -> usize {
        self.inner
            .ignored_by_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use edgegrid_core::StoredObject;

    #[tokio::test]
    async fn registers_caches_parents_first() {
        let ctrl = controller().await;
        assert_eq!(
            ctrl.sync().registered(),
            vec![
                edgegrid_core::Flavor::TYPE_NAME,
                edgegrid_core::Cloudlet::TYPE_NAME,
                edgegrid_core::CloudletInfo::TYPE_NAME,
                edgegrid_core::CloudletRefs::TYPE_NAME,
                edgegrid_core::App::TYPE_NAME,
                edgegrid_core::ClusterInst::TYPE_NAME,
                edgegrid_core::AppInst::TYPE_NAME,
                edgegrid_core::StreamObj::TYPE_NAME,
            ]
        );
    }

    #[tokio::test]
    async fn repeated_ignores_are_counted_per_target() {
        let ctrl = controller().await;
        use edgegrid_core::TrackedState::*;
        assert_eq!(ctrl.record_ignored("a".into(), Ready), 1);
        assert_eq!(ctrl.record_ignored("a".into(), Ready), 2);
        assert_eq!(ctrl.record_ignored("a".into(), Creating), 1);
        ctrl.forget_ignored("a");
        assert_eq!(ctrl.record_ignored("a".into(), Creating), 1);
        assert_eq!(ctrl.ignored_transitions(), 4);
    }
}
