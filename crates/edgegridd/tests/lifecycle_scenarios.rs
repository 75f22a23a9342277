//! End-to-end lifecycle scenarios with an in-process agent.

mod common;

use std::time::Duration;

use common::*;
use edgegrid_controller::{ApiError, ClusterInstUpdate};
use edgegrid_core::{CloudletState, CrmOverride, DeleteType, LProto, StreamState, TrackedState};
use edgegrid_sync::CollectProgress;

#[tokio::test]
async fn cluster_inst_create_reaches_ready() {
    let (plane, agent) = ready_plane().await;
    let ctrl = &plane.controller;
    let progress = CollectProgress::new();

    ctrl.create_cluster_inst(cluster("c1"), &progress).await.unwrap();

    let inst = ctrl.caches().cluster_inst.get(&cluster_key("c1")).unwrap();
    assert_eq!(inst.state, TrackedState::Ready);
    assert!(inst.errors.is_empty());
    assert!(progress.contains("agent create in progress"));
    assert_eq!(
        progress.messages().last().map(String::as_str),
        Some("Created ClusterInst successfully")
    );

    let refs = ctrl.cloudlet_refs(&cloudlet_key()).unwrap();
    assert_eq!(refs.clusters, vec![cluster_key("c1")]);
    assert_eq!(refs.used_dynamic_ips, 0);
    assert_eq!(agent.cluster_insts(), vec![cluster_key("c1")]);

    let stream = ctrl
        .stream_of::<edgegrid_core::ClusterInst>(&cluster_key("c1"))
        .unwrap();
    assert_eq!(stream.state, StreamState::Done);
    assert_eq!(stream.msgs, progress.messages());
}

#[tokio::test]
async fn dedicated_cluster_counts_one_dynamic_ip() {
    let (plane, _agent) = ready_plane().await;
    let ctrl = &plane.controller;
    ctrl.create_cluster_inst(dedicated_cluster("d1"), &CollectProgress::new())
        .await
        .unwrap();
    assert_eq!(ctrl.cloudlet_refs(&cloudlet_key()).unwrap().used_dynamic_ips, 1);

    ctrl.delete_cluster_inst(cluster("d1"), &CollectProgress::new())
        .await
        .unwrap();
    let refs = ctrl.cloudlet_refs(&cloudlet_key()).unwrap();
    assert_eq!(refs.used_dynamic_ips, 0);
    assert!(refs.clusters.is_empty());
    assert!(!ctrl.caches().cluster_inst.has_key(&cluster_key("d1")));
}

#[tokio::test]
async fn http_port_shares_the_l7_port() {
    let (plane, _agent) = ready_plane().await;
    let ctrl = &plane.controller;
    let progress = CollectProgress::new();
    ctrl.create_app(app("other", "tcp:8080")).await.unwrap();
    ctrl.create_app(app("web", "http:8080")).await.unwrap();
    ctrl.create_cluster_inst(cluster("c1"), &progress).await.unwrap();
    ctrl.create_app_inst(app_inst("other", "c1"), &progress).await.unwrap();

    ctrl.create_app_inst(app_inst("web", "c1"), &progress).await.unwrap();

    let web = ctrl.caches().app_inst.get(&app_inst_key("web", "c1")).unwrap();
    assert_eq!(web.state, TrackedState::Ready);
    let port = &web.mapped_ports[0];
    assert_eq!(port.proto, LProto::Http);
    assert_eq!(port.public_port, 443);
    assert_eq!(port.path_prefix, "/devorg-c1-web10/p8080");

    let refs = ctrl.cloudlet_refs(&cloudlet_key()).unwrap();
    assert_eq!(refs.root_lb_ports.get(&8080), Some(&1));
    assert!(!refs.root_lb_ports.contains_key(&443));
}

#[tokio::test]
async fn delete_cluster_in_use_is_refused() {
    let (plane, _agent) = ready_plane().await;
    let ctrl = &plane.controller;
    let progress = CollectProgress::new();
    ctrl.create_app(app("web", "tcp:80")).await.unwrap();
    ctrl.create_cluster_inst(cluster("c1"), &progress).await.unwrap();
    ctrl.create_app_inst(app_inst("web", "c1"), &progress).await.unwrap();
    let refs_before = ctrl.cloudlet_refs(&cloudlet_key()).unwrap();

    let err = ctrl
        .delete_cluster_inst(cluster("c1"), &progress)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InUse(_)));

    let inst = ctrl.caches().cluster_inst.get(&cluster_key("c1")).unwrap();
    assert_eq!(inst.state, TrackedState::Ready);
    assert_eq!(ctrl.cloudlet_refs(&cloudlet_key()).unwrap(), refs_before);
}

#[tokio::test]
async fn create_timeout_rolls_back() {
    let plane = plane().await;
    seed(&plane).await;
    let agent = attach_agent(
        &plane,
        edgegrid_controller::AgentBehavior {
            unresponsive: true,
            ..Default::default()
        },
    )
    .await;
    let ctrl = &plane.controller;
    let refs_before = ctrl.cloudlet_refs(&cloudlet_key()).unwrap();
    let progress = CollectProgress::new();

    let err = ctrl
        .create_cluster_inst(dedicated_cluster("slow"), &progress)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Timeout(_)));
    assert_eq!(
        err.to_string(),
        "Timed out; expected state Ready but is CreateRequested"
    );
    assert!(progress.contains("DELETING ClusterInst due to failures"));
    assert!(!ctrl.caches().cluster_inst.has_key(&cluster_key("slow")));
    assert_eq!(ctrl.cloudlet_refs(&cloudlet_key()).unwrap(), refs_before);
    drop(agent);
}

#[tokio::test]
async fn agent_create_error_rolls_back_with_errors() {
    let plane = plane().await;
    seed(&plane).await;
    let _agent = attach_agent(
        &plane,
        edgegrid_controller::AgentBehavior {
            fail_create: true,
            ..Default::default()
        },
    )
    .await;
    let ctrl = &plane.controller;

    let err = ctrl
        .create_cluster_inst(cluster("c1"), &CollectProgress::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Encountered failures: [agent create failed]");
    assert!(!ctrl.caches().cluster_inst.has_key(&cluster_key("c1")));
    assert!(ctrl.cloudlet_refs(&cloudlet_key()).unwrap().clusters.is_empty());
}

#[tokio::test]
async fn ignore_crm_errors_forces_ready() {
    let plane = plane().await;
    seed(&plane).await;
    let _agent = attach_agent(
        &plane,
        edgegrid_controller::AgentBehavior {
            fail_create: true,
            ..Default::default()
        },
    )
    .await;
    let ctrl = &plane.controller;
    let progress = CollectProgress::new();
    let mut inst = cluster("c1");
    inst.crm_override = CrmOverride::IgnoreCrmErrors;

    ctrl.create_cluster_inst(inst, &progress).await.unwrap();

    let stored = ctrl.caches().cluster_inst.get(&cluster_key("c1")).unwrap();
    assert_eq!(stored.state, TrackedState::Ready);
    assert!(stored.errors.is_empty());
    assert_eq!(stored.crm_override, CrmOverride::NoOverride);
    assert!(progress.contains("ignoring CRM failure"));
}

#[tokio::test]
async fn failed_delete_recreates() {
    let (plane, agent) = ready_plane().await;
    let ctrl = &plane.controller;
    ctrl.create_cluster_inst(dedicated_cluster("c1"), &CollectProgress::new())
        .await
        .unwrap();
    let refs_before = ctrl.cloudlet_refs(&cloudlet_key()).unwrap();
    agent.set_behavior(|b| b.fail_delete = true);

    let progress = CollectProgress::new();
    let err = ctrl
        .delete_cluster_inst(cluster("c1"), &progress)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Encountered failures: [agent delete failed]");
    assert!(progress.contains("Recreating ClusterInst due to failure"));

    let inst = ctrl.caches().cluster_inst.get(&cluster_key("c1")).unwrap();
    assert_eq!(inst.state, TrackedState::Ready);
    assert_eq!(ctrl.cloudlet_refs(&cloudlet_key()).unwrap(), refs_before);
}

#[tokio::test]
async fn app_inst_through_the_agent() {
    let (plane, agent) = ready_plane().await;
    let ctrl = &plane.controller;
    let progress = CollectProgress::new();
    ctrl.create_app(app("web", "tcp:80,udp:5000")).await.unwrap();
    ctrl.create_cluster_inst(cluster("c1"), &progress).await.unwrap();

    ctrl.create_app_inst(app_inst("web", "c1"), &progress).await.unwrap();
    assert_eq!(agent.app_insts(), vec![app_inst_key("web", "c1")]);

    ctrl.refresh_app_inst(&app_inst_key("web", "c1"), CrmOverride::NoOverride, &progress)
        .await
        .unwrap();
    assert!(progress.contains("Updated AppInst successfully"));

    ctrl.delete_app_inst(app_inst("web", "c1"), &progress).await.unwrap();
    assert!(ctrl.caches().app_inst.list().is_empty());
    assert!(ctrl.cloudlet_refs(&cloudlet_key()).unwrap().root_lb_ports.is_empty());
}

#[tokio::test]
async fn cluster_update_through_the_agent() {
    let (plane, _agent) = ready_plane().await;
    let ctrl = &plane.controller;
    let progress = CollectProgress::new();
    ctrl.create_cluster_inst(cluster("c1"), &progress).await.unwrap();

    ctrl.update_cluster_inst(
        ClusterInstUpdate {
            key: cluster_key("c1"),
            num_nodes: Some(2),
            crm_override: CrmOverride::NoOverride,
        },
        &progress,
    )
    .await
    .unwrap();
    let inst = ctrl.caches().cluster_inst.get(&cluster_key("c1")).unwrap();
    assert_eq!((inst.state, inst.num_nodes), (TrackedState::Ready, 2));
    assert_eq!(ctrl.cloudlet_refs(&cloudlet_key()).unwrap().used_ram, 3 * 2048);
}

#[tokio::test]
async fn cluster_delete_autodeletes_children_through_the_agent() {
    let (plane, _agent) = ready_plane().await;
    let ctrl = &plane.controller;
    let progress = CollectProgress::new();
    let mut sidecar = app("sidecar", "tcp:7000");
    sidecar.del_opt = DeleteType::AutoDelete;
    ctrl.create_app(sidecar).await.unwrap();
    ctrl.create_cluster_inst(cluster("c1"), &progress).await.unwrap();
    ctrl.create_app_inst(app_inst("sidecar", "c1"), &progress).await.unwrap();

    ctrl.delete_cluster_inst(cluster("c1"), &progress).await.unwrap();
    assert!(progress.contains("Autodeleting AppInst sidecar"));
    assert!(ctrl.caches().app_inst.list().is_empty());
    assert!(ctrl.caches().cluster_inst.list().is_empty());
}

#[tokio::test]
async fn agent_disconnect_marks_cloudlet_offline() {
    let (plane, mut agent) = ready_plane().await;
    let ctrl = &plane.controller;
    ctrl.create_cluster_inst(cluster("c1"), &CollectProgress::new())
        .await
        .unwrap();
    assert!(ctrl.caches().cluster_inst_info.has_key(&cluster_key("c1")));

    agent.disconnect();
    wait_cloudlet_state(&plane, CloudletState::Offline).await;
    assert!(!ctrl.caches().cluster_inst_info.has_key(&cluster_key("c1")));

    let err = ctrl
        .create_cluster_inst(cluster("c2"), &CollectProgress::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::CloudletNotReady(_)));

    agent.reconnect(&plane.notify);
    wait_cloudlet_state(&plane, CloudletState::Ready).await;
    assert_eq!(agent.cluster_insts(), vec![cluster_key("c1")]);
}

#[tokio::test]
async fn reconnect_prunes_objects_deleted_while_away() {
    let (plane, mut agent) = ready_plane().await;
    let ctrl = &plane.controller;
    ctrl.create_cluster_inst(cluster("c1"), &CollectProgress::new())
        .await
        .unwrap();
    agent.disconnect();
    wait_cloudlet_state(&plane, CloudletState::Offline).await;

    let mut gone = cluster("c1");
    gone.crm_override = CrmOverride::IgnoreCrm;
    ctrl.delete_cluster_inst(gone, &CollectProgress::new())
        .await
        .unwrap();
    assert_eq!(agent.cluster_insts(), vec![cluster_key("c1")]);

    agent.reconnect(&plane.notify);
    wait_cloudlet_state(&plane, CloudletState::Ready).await;
    // SendAllEnd precedes the cloudlet report being applied.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(agent.cluster_insts().is_empty());
}
