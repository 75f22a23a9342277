//! An in-process agent that answers provisioning requests.
//!
//! It stands in for the cloudlet resource manager in tests and in the
//! daemon's demo mode: every requested state is acknowledged with the
//! matching transitional state and then settled, after a short delay.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use edgegrid_core::{
    AppInstInfo, AppInstKey, CloudletInfo, CloudletKey, CloudletState, ClusterInstInfo,
    ClusterInstKey, TrackedState,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::lifecycle::Op;
use crate::notify::{AgentEndpoint, FromAgent, MessageChannel, NotifyServer, ToAgent};

/// How the agent answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentBehavior {
    /// Pause before each report.
    pub delay: Duration,
    pub fail_create: bool,
    pub fail_update: bool,
    pub fail_delete: bool,
    /// Receive requests but never answer them.
    pub unresponsive: bool,
}

impl Default for AgentBehavior {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(10),
            fail_create: false,
            fail_update: false,
            fail_delete: false,
            unresponsive: false,
        }
    }
}

/// The agent's copy of what the controller asked for.
#[derive(Default)]
struct Local {
    cluster_insts: BTreeMap<ClusterInstKey, TrackedState>,
    app_insts: BTreeMap<AppInstKey, TrackedState>,
    /// Keys re-sent since connecting, until `SendAllEnd`.
    resent: Option<(BTreeSet<ClusterInstKey>, BTreeSet<AppInstKey>)>,
}

impl Local {
    /// Record a state; true if it differs from what was recorded before.
    fn record_cluster(&mut self, key: &ClusterInstKey, state: TrackedState) -> bool {
        if let Some((clusters, _)) = &mut self.resent {
            clusters.insert(key.clone());
        }
        self.cluster_insts.insert(key.clone(), state) != Some(state)
    }

    fn record_app(&mut self, key: &AppInstKey, state: TrackedState) -> bool {
        if let Some((_, apps)) = &mut self.resent {
            apps.insert(key.clone());
        }
        self.app_insts.insert(key.clone(), state) != Some(state)
    }

    fn prune(&mut self) {
        let Some((clusters, apps)) = self.resent.take() else {
            return;
        };
        self.cluster_insts.retain(|k, _| clusters.contains(k));
        self.app_insts.retain(|k, _| apps.contains(k));
    }
}

fn requested_op(state: TrackedState) -> Option<Op> {
    match state {
        TrackedState::CreateRequested => Some(Op::Create),
        TrackedState::UpdateRequested => Some(Op::Update),
        TrackedState::DeleteRequested => Some(Op::Delete),
        _ => None,
    }
}

pub struct DummyAgent {
    cloudlet_key: CloudletKey,
    behavior: Arc<Mutex<AgentBehavior>>,
    local: Arc<Mutex<Local>>,
    conn_id: u64,
    task: Option<JoinHandle<()>>,
}

impl DummyAgent {
    /// Connect to `server` and report the cloudlet ready.
    pub fn connect(
        server: &Arc<NotifyServer>,
        cloudlet_key: CloudletKey,
        behavior: AgentBehavior,
    ) -> Self {
        let mut agent = Self {
            cloudlet_key,
            behavior: Arc::new(Mutex::new(behavior)),
            local: Arc::new(Mutex::new(Local::default())),
            conn_id: 0,
            task: None,
        };
        agent.attach(server);
        agent
    }

    fn attach(&mut self, server: &Arc<NotifyServer>) {
        let endpoint = server.connect(self.cloudlet_key.clone());
        self.conn_id = endpoint.conn_id();
        lock(&self.local).resent = Some(Default::default());
        let _ = endpoint.send(FromAgent::CloudletInfo(CloudletInfo {
            key: self.cloudlet_key.clone(),
            state: CloudletState::Ready,
            status: "ready".to_string(),
            notify_id: 0,
        }));
        self.task = Some(tokio::spawn(run(
            endpoint,
            Arc::clone(&self.behavior),
            Arc::clone(&self.local),
        )));
    }

    /// Drop the connection. Answers already in flight still arrive.
    pub fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn reconnect(&mut self, server: &Arc<NotifyServer>) {
        self.disconnect();
        self.attach(server);
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn set_behavior(&self, change: impl FnOnce(&mut AgentBehavior)) {
        change(&mut lock(&self.behavior));
    }

    /// ClusterInsts the agent currently knows about.
    pub fn cluster_insts(&self) -> Vec<ClusterInstKey> {
        lock(&self.local).cluster_insts.keys().cloned().collect()
    }

    pub fn app_insts(&self) -> Vec<AppInstKey> {
        lock(&self.local).app_insts.keys().cloned().collect()
    }
}

impl Drop for DummyAgent {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run(
    mut endpoint: AgentEndpoint,
    behavior: Arc<Mutex<AgentBehavior>>,
    local: Arc<Mutex<Local>>,
) {
    let tx = endpoint.sender();
    while let Some(msg) = endpoint.recv().await {
        trace!(conn_id = endpoint.conn_id(), ?msg, "agent received");
        match msg {
            ToAgent::ClusterInst(inst) => {
                let changed = lock(&local).record_cluster(&inst.key, inst.state);
                if let (true, Some(op)) = (changed, requested_op(inst.state)) {
                    let key = inst.key;
                    respond(tx.clone(), lock(&behavior).clone(), op, move |state, status, errors| {
                        FromAgent::ClusterInstInfo(ClusterInstInfo {
                            key: key.clone(),
                            state,
                            errors,
                            status,
                            notify_id: 0,
                        })
                    });
                }
            }
            ToAgent::AppInst(inst) => {
                let changed = lock(&local).record_app(&inst.key, inst.state);
                if let (true, Some(op)) = (changed, requested_op(inst.state)) {
                    let key = inst.key;
                    respond(tx.clone(), lock(&behavior).clone(), op, move |state, status, errors| {
                        FromAgent::AppInstInfo(AppInstInfo {
                            key: key.clone(),
                            state,
                            errors,
                            status,
                            notify_id: 0,
                        })
                    });
                }
            }
            ToAgent::ClusterInstDeleted(key) => {
                lock(&local).cluster_insts.remove(&key);
            }
            ToAgent::AppInstDeleted(key) => {
                lock(&local).app_insts.remove(&key);
            }
            ToAgent::SendAllEnd => lock(&local).prune(),
        }
    }
    debug!(conn_id = endpoint.conn_id(), "agent connection closed");
}

fn respond<F>(tx: mpsc::UnboundedSender<FromAgent>, behavior: AgentBehavior, op: Op, report: F)
where
    F: Fn(TrackedState, String, Vec<String>) -> FromAgent + Send + 'static,
{
    if behavior.unresponsive {
        return;
    }
    let (working, done, failed, fail, verb) = match op {
        Op::Create => (
            TrackedState::Creating,
            TrackedState::Ready,
            TrackedState::CreateError,
            behavior.fail_create,
            "create",
        ),
        Op::Update => (
            TrackedState::Updating,
            TrackedState::Ready,
            TrackedState::UpdateError,
            behavior.fail_update,
            "update",
        ),
        Op::Delete => (
            TrackedState::Deleting,
            TrackedState::NotPresent,
            TrackedState::DeleteError,
            behavior.fail_delete,
            "delete",
        ),
    };
    tokio::spawn(async move {
        tokio::time::sleep(behavior.delay).await;
        let _ = tx.send(report(working, format!("agent {verb} in progress"), Vec::new()));
        tokio::time::sleep(behavior.delay).await;
        let last = if fail {
            report(failed, String::new(), vec![format!("agent {verb} failed")])
        } else {
            report(done, String::new(), Vec::new())
        };
        let _ = tx.send(last);
    });
}
