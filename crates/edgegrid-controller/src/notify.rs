//! The controller side of the agent channel.
//!
//! Each agent connects for one cloudlet. The server sends it a snapshot of
//! every ClusterInst and AppInst placed there, then `SendAllEnd`, then
//! streams changes as the caches see them. Reports coming back are tagged
//! with the connection id, so everything a connection said can be
//! withdrawn when it goes away.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use edgegrid_core::{
    AppInst, AppInstInfo, AppInstKey, CloudletInfo, CloudletKey, ClusterInst, ClusterInstInfo,
    ClusterInstKey, TrackedState,
};
use edgegrid_sync::CacheEvent;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::controller::Controller;

/// Controller to agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ToAgent {
    ClusterInst(ClusterInst),
    ClusterInstDeleted(ClusterInstKey),
    AppInst(AppInst),
    AppInstDeleted(AppInstKey),
    /// Marks the end of the initial snapshot.
    SendAllEnd,
}

/// Agent to controller.
#[derive(Debug, Clone, PartialEq)]
pub enum FromAgent {
    CloudletInfo(CloudletInfo),
    ClusterInstInfo(ClusterInstInfo),
    AppInstInfo(AppInstInfo),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notify connection closed")]
    Closed,
}

/// Typed, ordered, bidirectional message channel.
pub trait MessageChannel {
    type Out: Send;
    type In: Send;

    fn send(&self, msg: Self::Out) -> Result<(), NotifyError>;

    /// Next message, or `None` once the peer has gone.
    fn recv(&mut self) -> impl Future<Output = Option<Self::In>> + Send;
}

/// The agent's end of an in-process connection.
pub struct AgentEndpoint {
    conn_id: u64,
    cloudlet_key: CloudletKey,
    tx: mpsc::UnboundedSender<FromAgent>,
    rx: mpsc::UnboundedReceiver<ToAgent>,
}

impl AgentEndpoint {
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn cloudlet_key(&self) -> &CloudletKey {
        &self.cloudlet_key
    }

    /// A sender usable from tasks other than the one reading.
    pub fn sender(&self) -> mpsc::UnboundedSender<FromAgent> {
        self.tx.clone()
    }
}

impl MessageChannel for AgentEndpoint {
    type Out = FromAgent;
    type In = ToAgent;

    fn send(&self, msg: FromAgent) -> Result<(), NotifyError> {
        self.tx.send(msg).map_err(|_| NotifyError::Closed)
    }

    fn recv(&mut self) -> impl Future<Output = Option<ToAgent>> + Send {
        self.rx.recv()
    }
}

struct Conn {
    cloudlet_key: CloudletKey,
    tx: mpsc::UnboundedSender<ToAgent>,
    /// Cache revisions covered by the snapshot sent on connect. Queued
    /// changes at or below them are already reflected there.
    cluster_rev: u64,
    app_rev: u64,
}

impl Conn {
    fn covers(&self, msg: &ToAgent, rev: u64) -> bool {
        let seen = match msg {
            ToAgent::ClusterInst(_) | ToAgent::ClusterInstDeleted(_) => self.cluster_rev,
            ToAgent::AppInst(_) | ToAgent::AppInstDeleted(_) => self.app_rev,
            ToAgent::SendAllEnd => return false,
        };
        rev != 0 && rev <= seen
    }
}

pub struct NotifyServer {
    controller: Controller,
    conns: Mutex<HashMap<u64, Conn>>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl NotifyServer {
    pub fn new(controller: Controller) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            controller,
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
            forwarder: Mutex::new(None),
        })
    }

    fn conns(&self) -> MutexGuard<'_, HashMap<u64, Conn>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start forwarding cache changes to connected agents.
    pub fn start(self: &Arc<Self>) {
        let mut cluster_events = self.controller.caches().cluster_inst.subscribe();
        let mut app_events = self.controller.caches().app_inst.subscribe();
        let mut stop = self.shutdown.subscribe();
        let server = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let (cloudlet, msg, rev) = tokio::select! {
                    Some(event) = cluster_events.recv() => match event {
                        CacheEvent::Updated { obj, mod_rev, .. } => {
                            (obj.key.cloudlet_key.clone(), ToAgent::ClusterInst(obj), mod_rev)
                        }
                        CacheEvent::Deleted { old, mod_rev } => (
                            old.key.cloudlet_key.clone(),
                            ToAgent::ClusterInstDeleted(old.key),
                            mod_rev,
                        ),
                    },
                    Some(event) = app_events.recv() => match event {
                        CacheEvent::Updated { obj, mod_rev, .. } => {
                            (obj.key.cloudlet_key().clone(), ToAgent::AppInst(obj), mod_rev)
                        }
                        CacheEvent::Deleted { old, mod_rev } => (
                            old.key.cloudlet_key().clone(),
                            ToAgent::AppInstDeleted(old.key),
                            mod_rev,
                        ),
                    },
                    _ = stop.changed() => break,
                    else => break,
                };
                let Some(server) = server.upgrade() else { break };
                server.broadcast(&cloudlet, msg, rev);
            }
            debug!("notify forwarder finished");
        });
        *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.forwarder.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        self.conns().clear();
    }

    pub fn connection_count(&self) -> usize {
        self.conns().len()
    }

    fn broadcast(&self, cloudlet: &CloudletKey, msg: ToAgent, rev: u64) {
        for (conn_id, conn) in self.conns().iter() {
            if conn.cloudlet_key != *cloudlet {
                continue;
            }
            if conn.covers(&msg, rev) {
                trace!(conn_id, rev, "change already in snapshot");
                continue;
            }
            let _ = conn.tx.send(msg.clone());
        }
    }

    /// Accept an agent for `cloudlet_key`.
    pub fn connect(self: &Arc<Self>, cloudlet_key: CloudletKey) -> AgentEndpoint {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (to_agent, agent_rx) = mpsc::unbounded_channel();
        let (agent_tx, mut from_agent) = mpsc::unbounded_channel();

        {
            // Holding the table while the snapshot goes out keeps the
            // forwarder from interleaving changes ahead of it.
            let mut conns = self.conns();
            let caches = self.controller.caches();
            let (clusters, cluster_rev) = caches
                .cluster_inst
                .filtered_at_rev(|c| c.key.cloudlet_key == cloudlet_key);
            let (apps, app_rev) = caches
                .app_inst
                .filtered_at_rev(|ai| *ai.key.cloudlet_key() == cloudlet_key);
            for inst in clusters {
                let _ = to_agent.send(ToAgent::ClusterInst(inst));
            }
            for inst in apps {
                let _ = to_agent.send(ToAgent::AppInst(inst));
            }
            let _ = to_agent.send(ToAgent::SendAllEnd);
            conns.insert(
                conn_id,
                Conn {
                    cloudlet_key: cloudlet_key.clone(),
                    tx: to_agent,
                    cluster_rev,
                    app_rev,
                },
            );
        }
        info!(conn_id, cloudlet = %cloudlet_key, "agent connected");

        let server = Arc::clone(self);
        let recv_cloudlet = cloudlet_key.clone();
        tokio::spawn(async move {
            // One report at a time, so an agent's reports apply in order.
            while let Some(msg) = from_agent.recv().await {
                server.handle(conn_id, msg).await;
            }
            server.disconnect(conn_id, &recv_cloudlet).await;
        });

        AgentEndpoint {
            conn_id,
            cloudlet_key,
            tx: agent_tx,
            rx: agent_rx,
        }
    }

    async fn handle(&self, conn_id: u64, msg: FromAgent) {
        let ctrl = &self.controller;
        let result = match msg {
            FromAgent::CloudletInfo(mut report) => {
                report.notify_id = conn_id;
                ctrl.update_cloudlet_info(report).await
            }
            FromAgent::ClusterInstInfo(mut report) => {
                report.notify_id = conn_id;
                let cache = &ctrl.caches().cluster_inst_info;
                if report.state == TrackedState::NotPresent {
                    cache.delete(&report.key, 0);
                } else {
                    cache.update(report.clone(), 0);
                }
                ctrl.cluster_inst_update_from_info(&report).await.map(|_| ())
            }
            FromAgent::AppInstInfo(mut report) => {
                report.notify_id = conn_id;
                let cache = &ctrl.caches().app_inst_info;
                if report.state == TrackedState::NotPresent {
                    cache.delete(&report.key, 0);
                } else {
                    cache.update(report.clone(), 0);
                }
                ctrl.app_inst_update_from_info(&report).await.map(|_| ())
            }
        };
        if let Err(e) = result {
            warn!(conn_id, error = %e, "failed to apply agent report");
        }
    }

    async fn disconnect(&self, conn_id: u64, cloudlet_key: &CloudletKey) {
        self.conns().remove(&conn_id);
        let caches = self.controller.caches();
        let flushed =
            caches.cluster_inst_info.flush(conn_id) + caches.app_inst_info.flush(conn_id);
        if let Err(e) = self
            .controller
            .cloudlet_info_offline(cloudlet_key, conn_id)
            .await
        {
            warn!(conn_id, error = %e, "failed to mark cloudlet offline");
        }
        info!(conn_id, cloudlet = %cloudlet_key, flushed, "agent disconnected");
    }
}

impl Drop for NotifyServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::{cloudlet_key, controller};

    fn cluster(state: TrackedState) -> ClusterInst {
        ClusterInst {
            key: ClusterInstKey::new("c1", cloudlet_key(), "dev"),
            state,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn queued_changes_behind_the_snapshot_are_not_replayed() {
        let ctrl = controller().await;
        let server = NotifyServer::new(ctrl.clone());
        server.start();

        // Both changes are queued for the forwarder, which has not run yet.
        let cache = &ctrl.caches().cluster_inst;
        cache.update(cluster(TrackedState::CreateRequested), 5);
        cache.update(cluster(TrackedState::Ready), 6);

        let mut endpoint = server.connect(cloudlet_key());
        assert_eq!(
            endpoint.recv().await,
            Some(ToAgent::ClusterInst(cluster(TrackedState::Ready)))
        );
        assert_eq!(endpoint.recv().await, Some(ToAgent::SendAllEnd));

        cache.update(cluster(TrackedState::UpdateRequested), 7);
        assert_eq!(
            endpoint.recv().await,
            Some(ToAgent::ClusterInst(cluster(TrackedState::UpdateRequested)))
        );
        server.stop();
    }

    #[tokio::test]
    async fn other_cloudlets_are_not_sent() {
        let ctrl = controller().await;
        let server = NotifyServer::new(ctrl.clone());
        server.start();
        let mut endpoint = server.connect(CloudletKey::new("operator", "edge2"));
        assert_eq!(endpoint.recv().await, Some(ToAgent::SendAllEnd));

        ctrl.caches().cluster_inst.update(cluster(TrackedState::Ready), 3);
        let next = tokio::time::timeout(std::time::Duration::from_millis(50), endpoint.recv()).await;
        assert!(next.is_err());
        server.stop();
    }
}
