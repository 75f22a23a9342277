//! Shared fixtures for the control plane integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use edgegrid_controller::{AgentBehavior, DummyAgent};
use edgegrid_core::{
    App, AppInst, AppInstKey, AppKey, Cloudlet, CloudletKey, CloudletState, ClusterInst,
    ClusterInstKey, ControllerConfig, DeleteType, Deployment, Flavor, FlavorKey, IpAccess,
    IpSupport, PlatformType,
};
use edgegrid_store::KvStore;
use edgegridd::ControlPlane;

pub const ORG: &str = "devorg";

pub fn cloudlet_key() -> CloudletKey {
    CloudletKey::new("operator", "edge1")
}

pub fn cluster_key(name: &str) -> ClusterInstKey {
    ClusterInstKey::new(name, cloudlet_key(), ORG)
}

pub fn cluster(name: &str) -> ClusterInst {
    ClusterInst {
        key: cluster_key(name),
        flavor: FlavorKey::new("small"),
        num_nodes: 1,
        ..Default::default()
    }
}

pub fn dedicated_cluster(name: &str) -> ClusterInst {
    ClusterInst {
        ip_access: IpAccess::Dedicated,
        ..cluster(name)
    }
}

pub fn app(name: &str, ports: &str) -> App {
    App {
        key: AppKey::new(ORG, name, "1.0"),
        deployment: Deployment::Kubernetes,
        image_path: format!("registry.local/{name}:1.0"),
        access_ports: ports.to_string(),
        default_flavor: FlavorKey::new("small"),
        internal_ports: false,
        del_opt: DeleteType::NoAutoDelete,
    }
}

pub fn app_inst_key(app_name: &str, cluster_name: &str) -> AppInstKey {
    AppInstKey::new(AppKey::new(ORG, app_name, "1.0"), cluster_key(cluster_name))
}

pub fn app_inst(app_name: &str, cluster_name: &str) -> AppInst {
    AppInst {
        key: app_inst_key(app_name, cluster_name),
        ..Default::default()
    }
}

pub async fn plane() -> ControlPlane {
    ControlPlane::in_memory(&ControllerConfig::for_tests())
        .await
        .unwrap()
}

pub async fn plane_over(store: Arc<dyn KvStore>) -> ControlPlane {
    ControlPlane::start(&ControllerConfig::for_tests(), store)
        .await
        .unwrap()
}

/// A `small` flavor and a fake cloudlet with three dynamic IPs.
pub async fn seed(plane: &ControlPlane) {
    seed_with_ips(plane, 3).await;
}

pub async fn seed_with_ips(plane: &ControlPlane, num_dynamic_ips: i32) {
    let ctrl = &plane.controller;
    ctrl.create_flavor(Flavor {
        key: FlavorKey::new("small"),
        ram_mb: 2048,
        vcpus: 2,
        disk_gb: 20,
    })
    .await
    .unwrap();
    ctrl.create_cloudlet(Cloudlet {
        key: cloudlet_key(),
        platform_type: PlatformType::Fake,
        ip_support: IpSupport::Dynamic,
        num_dynamic_ips,
    })
    .await
    .unwrap();
}

/// Connect a dummy agent and wait for it to report the cloudlet ready.
pub async fn attach_agent(plane: &ControlPlane, behavior: AgentBehavior) -> DummyAgent {
    let agent = DummyAgent::connect(&plane.notify, cloudlet_key(), behavior);
    wait_cloudlet_state(plane, CloudletState::Ready).await;
    agent
}

pub async fn wait_cloudlet_state(plane: &ControlPlane, state: CloudletState) {
    plane
        .controller
        .caches()
        .cloudlet_info
        .wait_for(&cloudlet_key(), Duration::from_secs(2), |info| {
            info.is_some_and(|i| i.state == state)
        })
        .await
        .unwrap();
}

/// A seeded plane with a responsive agent attached.
pub async fn ready_plane() -> (ControlPlane, DummyAgent) {
    let plane = plane().await;
    seed(&plane).await;
    let agent = attach_agent(&plane, AgentBehavior::default()).await;
    (plane, agent)
}
