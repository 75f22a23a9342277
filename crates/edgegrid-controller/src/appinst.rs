//! AppInst lifecycle: placement on a cluster, port mapping, agent hand-off.

use std::time::{SystemTime, UNIX_EPOCH};

use edgegrid_core::{
    App, AppInst, AppInstInfo, AppInstKey, AppPort, Cloudlet, CloudletRefs, ClusterInst,
    ClusterInstKey, CrmOverride, Deployment, Flavor, IpAccess, Liveness, ObjKey, TrackedState,
    parse_app_ports,
};
use edgegrid_sync::Progress;
use tracing::{error, info, warn};

use crate::alloc::{self, ports::protocol_bits};
use crate::call_context::CallContext;
use crate::cloudlet::check_cloudlet_ready;
use crate::clusterinst::ApiFuture;
use crate::controller::Controller;
use crate::error::{ApiError, ApiResult};
use crate::lifecycle::{self, InfoOutcome, Op, ignore_crm, ignore_crm_errors, ignore_transient};

/// Lowercase a name into something usable as a DNS label.
fn dns_sanitize(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            '_' | ' ' => Some('-'),
            _ => None,
        })
        .collect()
}

fn shared_fqdn(cloudlet: &Cloudlet, dns_root: &str) -> String {
    format!(
        "{}.{}.{}",
        dns_sanitize(&cloudlet.key.name),
        dns_sanitize(&cloudlet.key.organization),
        dns_root
    )
}

/// Path prefix under which an instance's HTTP ports are exposed on the
/// shared L7 port.
fn l7_path_base(key: &AppInstKey) -> String {
    format!(
        "/{}-{}-{}{}",
        dns_sanitize(&key.cluster_inst_key.organization),
        dns_sanitize(&key.cluster_inst_key.cluster_key.name),
        dns_sanitize(&key.app_key.name),
        dns_sanitize(&key.app_key.version)
    )
}

fn port_span(port: &AppPort) -> (i32, i32) {
    let end = if port.end_port == 0 { port.internal_port } else { port.end_port };
    (port.internal_port, end)
}

/// First port of `wanted` that collides with `taken` on the same protocol.
fn overlapping_port<'a>(wanted: &'a [AppPort], taken: &[AppPort]) -> Option<&'a AppPort> {
    wanted.iter().find(|w| {
        let (ws, we) = port_span(w);
        taken.iter().any(|t| {
            let (ts, te) = port_span(t);
            protocol_bits(w.proto) & protocol_bits(t.proto) != 0 && ws <= te && ts <= we
        })
    })
}

fn port_in_use_message(port: &AppPort) -> String {
    if port.end_port != 0 && port.end_port != port.internal_port {
        format!(
            "port range {}-{} overlaps with ports in use on the cluster",
            port.internal_port, port.end_port
        )
    } else {
        format!("port {} is already in use on the cluster", port.internal_port)
    }
}

/// Whether a sibling in `state` still claims its ports on a dedicated
/// cluster. Siblings in DeleteError or on their way out do not; siblings
/// still being created or updated do.
fn holds_dedicated_ports(state: TrackedState) -> bool {
    !matches!(
        state,
        TrackedState::DeleteError
            | TrackedState::DeletePrepare
            | TrackedState::DeleteRequested
            | TrackedState::Deleting
    )
}

/// Whether the port reservations of an AppInst in `state` are still held.
fn holds_reservations(state: TrackedState) -> bool {
    !matches!(
        state,
        TrackedState::DeleteRequested | TrackedState::Deleting | TrackedState::DeleteError
    )
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

impl Controller {
    pub async fn create_app_inst(&self, mut inst: AppInst, progress: &dyn Progress) -> ApiResult<()> {
        inst.liveness = Liveness::Static;
        let stream = self.start_stream::<AppInst>(&inst.key, progress).await?;
        let result = self
            .create_app_inst_internal(CallContext::new(), inst, &stream)
            .await;
        stream.finish(&result).await;
        result
    }

    pub async fn delete_app_inst(&self, inst: AppInst, progress: &dyn Progress) -> ApiResult<()> {
        let stream = self.start_stream::<AppInst>(&inst.key, progress).await?;
        let result = self
            .delete_app_inst_internal(CallContext::new(), inst, &stream)
            .await;
        stream.finish(&result).await;
        result
    }

    pub fn show_app_insts(&self, filter: &AppInst) -> Vec<AppInst> {
        let mut out = Vec::new();
        let _ = self.caches().app_inst.show(filter, |ai| {
            out.push(ai.clone());
            Ok::<_, ()>(())
        });
        out
    }

    pub async fn app_inst_update_from_info(&self, info: &AppInstInfo) -> ApiResult<InfoOutcome> {
        self.tracked_update_from_info::<AppInst, _>(info).await
    }

    pub async fn app_inst_replace_error_state(
        &self,
        key: &AppInstKey,
        state: TrackedState,
    ) -> ApiResult<()> {
        self.tracked_replace_error_state::<AppInst>(key, state).await
    }

    pub(crate) fn create_app_inst_internal<'a>(
        &'a self,
        cctx: CallContext,
        inst: AppInst,
        progress: &'a dyn Progress,
    ) -> ApiFuture<'a> {
        Box::pin(async move {
            let mut cctx = cctx;
            let mut inst = inst;
            cctx.set_override(&mut inst.crm_override);
            inst.key.validate()?;
            if inst.liveness == Liveness::Unknown {
                inst.liveness = Liveness::Dynamic;
            }

            let cluster_key = inst.key.cluster_inst_key.clone();
            let mut auto_created = false;
            if cluster_key.is_auto_cluster()
                && !cctx.undo
                && !self.caches().cluster_inst.has_key(&cluster_key)
            {
                let app = self
                    .caches()
                    .app
                    .get(&inst.key.app_key)
                    .ok_or_else(|| ApiError::not_found::<App>(&inst.key.app_key))?;
                progress.send(&format!(
                    "Creating new auto-cluster named {} to deploy AppInst",
                    cluster_key.cluster_key.name
                ));
                self.create_cluster_inst_internal(
                    cctx.with_auto_cluster(),
                    auto_cluster_for(&app, &inst, cluster_key.clone()),
                    progress,
                )
                .await?;
                auto_created = true;
            }

            let result = self.create_app_inst_body(cctx, inst, progress).await;
            if result.is_err() && auto_created {
                progress.send("Deleting auto-ClusterInst due to failure");
                let auto = ClusterInst {
                    key: cluster_key.clone(),
                    ..Default::default()
                };
                if let Err(undo_err) = self
                    .delete_cluster_inst_internal(cctx.with_undo().with_auto_cluster(), auto, progress)
                    .await
                {
                    error!(cluster_inst = %cluster_key, error = %undo_err, "failed to remove auto cluster");
                    progress.send(&format!("Failed to cleanup auto-ClusterInst: {undo_err}"));
                }
            }
            result
        })
    }

    async fn create_app_inst_body(
        &self,
        cctx: CallContext,
        inst: AppInst,
        progress: &dyn Progress,
    ) -> ApiResult<()> {
        let key = inst.key.clone();
        let created_at = now_secs();
        let dns_root = self.settings().app_dns_root.clone();
        let path_base = l7_path_base(&key);
        let mut previous_errors: Option<Vec<String>> = None;
        let mut committed = inst.clone();
        let result = self
            .sync()
            .apply_stm_wait(|stm| {
                previous_errors = None;
                let mut obj = inst.clone();
                if !ignore_crm(&cctx) && !cctx.skip_cloudlet_ready_check {
                    check_cloudlet_ready(stm, key.cloudlet_key())?;
                }
                let existing = stm.get::<AppInst>(&key)?;
                if let Some(existing) = &existing {
                    if !cctx.undo
                        && existing.state != TrackedState::DeleteError
                        && !ignore_transient(&cctx, existing.state)
                    {
                        if existing.state == TrackedState::CreateError {
                            previous_errors = Some(existing.errors.clone());
                        }
                        return Err(ApiError::key_exists::<AppInst>(&key));
                    }
                }
                let app = stm
                    .get::<App>(&key.app_key)?
                    .ok_or_else(|| ApiError::not_found::<App>(&key.app_key))?;
                let cloudlet = stm
                    .get::<Cloudlet>(key.cloudlet_key())?
                    .ok_or_else(|| ApiError::not_found::<Cloudlet>(key.cloudlet_key()))?;
                let cluster = stm.get::<ClusterInst>(&key.cluster_inst_key)?.ok_or_else(|| {
                    ApiError::Invalid(format!("ClusterInst {} not found", key.cluster_inst_key))
                })?;
                if cluster.state != TrackedState::Ready && !cctx.undo {
                    return Err(ApiError::Invalid(format!(
                        "ClusterInst {} not ready, state is {}",
                        key.cluster_inst_key, cluster.state
                    )));
                }
                if obj.flavor.name.is_empty() {
                    obj.flavor = app.default_flavor.clone();
                }
                if !stm.exists::<Flavor>(&obj.flavor)? {
                    return Err(ApiError::Invalid(format!("Flavor {} not found", obj.flavor)));
                }

                let mut ports = parse_app_ports(&app.access_ports)?;
                if app.internal_ports {
                    obj.uri = String::new();
                } else if cluster.ip_access == IpAccess::Dedicated {
                    for port in ports.iter_mut() {
                        port.public_port = port.internal_port;
                    }
                    // Rewriting the refs makes concurrent creates on this
                    // cloudlet conflict, so a sibling committed meanwhile
                    // is seen on retry.
                    let refs = stm
                        .get::<CloudletRefs>(key.cloudlet_key())?
                        .unwrap_or_else(|| CloudletRefs::new(key.cloudlet_key().clone()));
                    stm.put(&refs)?;
                    if !cctx.undo {
                        let sibling_ports: Vec<AppPort> = stm
                            .list::<AppInst>()?
                            .into_iter()
                            .filter(|ai| {
                                ai.key.cluster_inst_key == key.cluster_inst_key
                                    && ai.key != key
                                    && holds_dedicated_ports(ai.state)
                            })
                            .flat_map(|ai| ai.mapped_ports)
                            .collect();
                        if let Some(port) = overlapping_port(&ports, &sibling_ports) {
                            return Err(ApiError::Invalid(port_in_use_message(port)));
                        }
                    }
                    obj.uri = format!(
                        "{}.{}",
                        dns_sanitize(&key.cluster_inst_key.cluster_key.name),
                        shared_fqdn(&cloudlet, &dns_root)
                    );
                } else {
                    let mut refs = stm
                        .get::<CloudletRefs>(key.cloudlet_key())?
                        .unwrap_or_else(|| CloudletRefs::new(key.cloudlet_key().clone()));
                    if let Some(existing) = &existing {
                        if holds_reservations(existing.state) {
                            alloc::release_shared_ports(&mut refs, &existing.mapped_ports);
                        }
                    }
                    alloc::allocate_shared_ports(&mut refs, &mut ports, &path_base)?;
                    stm.put(&refs)?;
                    obj.uri = shared_fqdn(&cloudlet, &dns_root);
                }
                obj.mapped_ports = ports;
                obj.created_at = existing.map_or(created_at, |e| e.created_at);
                obj.errors.clear();
                obj.status.clear();
                obj.state = if ignore_crm(&cctx) {
                    TrackedState::Ready
                } else {
                    TrackedState::CreateRequested
                };
                stm.put(&obj)?;
                committed = obj;
                Ok(())
            })
            .await;
        if let Err(err) = result {
            if let Some(errors) = previous_errors {
                progress.send(&format!("Previous create failed, {}", errors.join(", ")));
                progress.send("Use DeleteAppInst to remove and try again");
            }
            return Err(err);
        }
        info!(app_inst = %key, uri = %committed.uri, state = %committed.state, "app inst committed");
        if ignore_crm(&cctx) {
            return Ok(());
        }

        let timeout = self.settings().timeouts.create_app_inst;
        match lifecycle::await_agent(&self.caches().app_inst, &key, Op::Create, timeout, progress)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if ignore_crm_errors(&cctx) => {
                progress.send(&format!("Create AppInst ignoring CRM failure: {err}"));
                self.app_inst_replace_error_state(&key, TrackedState::Ready)
                    .await?;
                progress.send("Created AppInst successfully");
                Ok(())
            }
            Err(err) => {
                progress.send("Deleting AppInst due to failures");
                if let Err(undo_err) = self
                    .delete_app_inst_internal(cctx.with_undo(), committed, progress)
                    .await
                {
                    error!(app_inst = %key, error = %undo_err, "failed to undo app inst create");
                    progress.send(&format!("Failed to undo AppInst creation: {undo_err}"));
                }
                Err(err)
            }
        }
    }

    pub(crate) fn delete_app_inst_internal<'a>(
        &'a self,
        cctx: CallContext,
        inst: AppInst,
        progress: &'a dyn Progress,
    ) -> ApiFuture<'a> {
        Box::pin(async move {
            let mut cctx = cctx;
            let mut inst = inst;
            cctx.set_override(&mut inst.crm_override);
            let key = inst.key.clone();
            key.validate()?;

            let mut previous_errors: Option<Vec<String>> = None;
            let mut released = inst.clone();
            let result = self
                .sync()
                .apply_stm_wait(|stm| {
                    previous_errors = None;
                    let mut cur = stm
                        .get::<AppInst>(&key)?
                        .ok_or_else(|| ApiError::not_found::<AppInst>(&key))?;
                    if cur.state == TrackedState::DeleteError {
                        previous_errors = Some(cur.errors.clone());
                    }
                    lifecycle::check_deletable(&cctx, "AppInst", cur.state)?;
                    if !ignore_crm(&cctx) && !cctx.skip_cloudlet_ready_check {
                        check_cloudlet_ready(stm, key.cloudlet_key())?;
                    }
                    let cluster = stm.get::<ClusterInst>(&key.cluster_inst_key)?;
                    if cluster.is_some_and(|c| c.ip_access == IpAccess::Shared) {
                        if let Some(mut refs) = stm.get::<CloudletRefs>(key.cloudlet_key())? {
                            alloc::release_shared_ports(&mut refs, &cur.mapped_ports);
                            stm.put(&refs)?;
                        }
                    }
                    released = cur.clone();
                    if ignore_crm(&cctx) {
                        stm.delete::<AppInst>(&key);
                    } else {
                        cur.state = TrackedState::DeleteRequested;
                        stm.put(&cur)?;
                    }
                    Ok(())
                })
                .await;
            if let Err(err) = result {
                if let Some(errors) = previous_errors {
                    progress.send(&format!("Previous delete failed, {}", errors.join(", ")));
                    progress.send("Use CreateAppInst to rebuild, and try again");
                }
                return Err(err);
            }
            info!(app_inst = %key, undo = cctx.undo, "app inst delete committed");

            if ignore_crm(&cctx) {
                self.clear_ignored_transitions::<AppInst>(&key);
            } else {
                let timeout = self.settings().timeouts.delete_app_inst;
                let waited = lifecycle::await_agent(
                    &self.caches().app_inst,
                    &key,
                    Op::Delete,
                    timeout,
                    progress,
                )
                .await;
                match waited {
                    Ok(()) => {}
                    Err(err) if ignore_crm_errors(&cctx) => {
                        progress.send(&format!("Delete AppInst ignoring CRM failure: {err}"));
                        self.app_inst_replace_error_state(&key, TrackedState::NotPresent)
                            .await?;
                        progress.send("Deleted AppInst successfully");
                    }
                    Err(err) => {
                        progress.send("Recreating AppInst due to failure");
                        released.crm_override = CrmOverride::NoOverride;
                        if let Err(undo_err) = self
                            .create_app_inst_internal(cctx.with_undo(), released, progress)
                            .await
                        {
                            error!(app_inst = %key, error = %undo_err, "failed to undo app inst delete");
                            progress.send(&format!("Failed to undo AppInst deletion: {undo_err}"));
                        }
                        return Err(err);
                    }
                }
            }

            if !cctx.undo {
                self.remove_unused_auto_cluster(&key.cluster_inst_key, cctx.crm_override, progress)
                    .await;
            }
            Ok(())
        })
    }

    /// Delete an auto cluster once its last AppInst is gone. A cluster
    /// that is itself being deleted is left to that delete.
    async fn remove_unused_auto_cluster(
        &self,
        key: &ClusterInstKey,
        crm_override: CrmOverride,
        progress: &dyn Progress,
    ) {
        let Some(cluster) = self.caches().cluster_inst.get(key) else {
            return;
        };
        if !cluster.auto
            || cluster.state != TrackedState::Ready
            || !self.app_insts_on_cluster(key).is_empty()
        {
            return;
        }
        progress.send(&format!("Deleting auto-ClusterInst {}", key.cluster_key.name));
        let cctx = CallContext {
            crm_override,
            ..CallContext::new().with_auto_cluster()
        };
        if let Err(e) = self.delete_cluster_inst_internal(cctx, cluster, progress).await {
            warn!(cluster_inst = %key, error = %e, "failed to delete unused auto cluster");
            progress.send(&format!("Failed to delete auto-ClusterInst: {e}"));
        }
    }

    /// Ask the agent to re-apply an AppInst. Not rolled back on failure.
    pub async fn refresh_app_inst(
        &self,
        key: &AppInstKey,
        crm_override: CrmOverride,
        progress: &dyn Progress,
    ) -> ApiResult<()> {
        let mut cctx = CallContext::new();
        let mut requested = crm_override;
        cctx.set_override(&mut requested);
        key.validate()?;

        let mut previous_errors: Option<Vec<String>> = None;
        self.sync()
            .apply_stm_wait(|stm| {
                previous_errors = None;
                if !ignore_crm(&cctx) {
                    check_cloudlet_ready(stm, key.cloudlet_key())?;
                }
                let mut cur = stm
                    .get::<AppInst>(key)?
                    .ok_or_else(|| ApiError::not_found::<AppInst>(key))?;
                if cur.state != TrackedState::Ready && !ignore_transient(&cctx, cur.state) {
                    if cur.state != TrackedState::UpdateError {
                        return Err(ApiError::Busy(format!(
                            "AppInst busy ({}), cannot update",
                            cur.state
                        )));
                    }
                    previous_errors = Some(cur.errors.clone());
                }
                cur.state = if ignore_crm(&cctx) {
                    TrackedState::Ready
                } else {
                    TrackedState::UpdateRequested
                };
                stm.put(&cur)?;
                Ok(())
            })
            .await?;
        if let Some(errors) = previous_errors {
            progress.send(&format!(
                "Previous update failed, {}, trying again",
                errors.join(", ")
            ));
        }
        if ignore_crm(&cctx) {
            return Ok(());
        }

        let timeout = self.settings().timeouts.update_app_inst;
        match lifecycle::await_agent(&self.caches().app_inst, key, Op::Update, timeout, progress)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if ignore_crm_errors(&cctx) => {
                progress.send(&format!("Update AppInst ignoring CRM failure: {err}"));
                self.app_inst_replace_error_state(key, TrackedState::Ready)
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// The cluster created on demand for an AppInst naming an absent
/// auto cluster.
fn auto_cluster_for(app: &App, inst: &AppInst, key: ClusterInstKey) -> ClusterInst {
    let flavor = if inst.flavor.name.is_empty() {
        app.default_flavor.clone()
    } else {
        inst.flavor.clone()
    };
    let mut cluster = ClusterInst {
        key,
        flavor,
        liveness: Liveness::Dynamic,
        auto: true,
        ..Default::default()
    };
    if app.deployment == Deployment::Docker {
        cluster.deployment = Some(Deployment::Docker);
    } else {
        cluster.deployment = Some(Deployment::Kubernetes);
        cluster.num_masters = 1;
        cluster.num_nodes = 1;
    }
    cluster
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::*;
    use edgegrid_core::{AppKey, DeleteType, FlavorKey, LProto};
    use edgegrid_sync::CollectProgress;

    fn app(name: &str, ports: &str) -> App {
        App {
            key: AppKey::new("dev", name, "1.0"),
            deployment: Deployment::Kubernetes,
            access_ports: ports.to_string(),
            default_flavor: FlavorKey::new("small"),
            ..Default::default()
        }
    }

    fn cluster(name: &str, ip_access: IpAccess) -> ClusterInst {
        ClusterInst {
            key: ClusterInstKey::new(name, cloudlet_key(), "dev"),
            flavor: FlavorKey::new("small"),
            ip_access,
            crm_override: CrmOverride::IgnoreCrm,
            ..Default::default()
        }
    }

    fn app_inst(app_name: &str, cluster_name: &str) -> AppInst {
        AppInst {
            key: AppInstKey::new(
                AppKey::new("dev", app_name, "1.0"),
                ClusterInstKey::new(cluster_name, cloudlet_key(), "dev"),
            ),
            crm_override: CrmOverride::IgnoreCrm,
            ..Default::default()
        }
    }

    #[test]
    fn sanitizes_dns_labels() {
        assert_eq!(dns_sanitize("Edge_Site 1.a"), "edge-site-1a");
    }

    #[test]
    fn overlap_respects_protocol_and_ranges() {
        let taken = parse_app_ports("tcp:8000-8010").unwrap();
        assert_eq!(
            overlapping_port(&parse_app_ports("udp:8005").unwrap(), &taken),
            None
        );
        let wanted = parse_app_ports("tcp:80,tcp:8010").unwrap();
        assert_eq!(
            overlapping_port(&wanted, &taken).map(|p| p.internal_port),
            Some(8010)
        );
    }

    #[test]
    fn port_conflicts_name_the_port_or_range() {
        let single = &parse_app_ports("tcp:80").unwrap()[0];
        assert_eq!(port_in_use_message(single), "port 80 is already in use on the cluster");
        let range = &parse_app_ports("udp:5000-5010").unwrap()[0];
        assert_eq!(
            port_in_use_message(range),
            "port range 5000-5010 overlaps with ports in use on the cluster"
        );
        let degenerate = AppPort {
            end_port: 7000,
            ..parse_app_ports("tcp:7000").unwrap()[0].clone()
        };
        assert_eq!(
            port_in_use_message(&degenerate),
            "port 7000 is already in use on the cluster"
        );
    }

    #[tokio::test]
    async fn shared_ports_are_allocated_and_released() {
        let ctrl = controller().await;
        seed(&ctrl).await;
        let progress = CollectProgress::new();
        ctrl.create_app(app("web", "tcp:80,http:8080")).await.unwrap();
        ctrl.create_app(app("api", "tcp:80")).await.unwrap();
        ctrl.create_cluster_inst(cluster("c1", IpAccess::Shared), &progress)
            .await
            .unwrap();

        ctrl.create_app_inst(app_inst("web", "c1"), &progress).await.unwrap();
        ctrl.create_app_inst(app_inst("api", "c1"), &progress).await.unwrap();

        let web = ctrl.caches().app_inst.get(&app_inst("web", "c1").key).unwrap();
        assert_eq!(web.state, TrackedState::Ready);
        assert_eq!(web.uri, "edge1.operator.edgegrid.net");
        assert_eq!(web.mapped_ports[0].public_port, 80);
        assert_eq!(web.mapped_ports[1].proto, LProto::Http);
        assert_eq!(web.mapped_ports[1].public_port, 443);
        assert_eq!(web.mapped_ports[1].path_prefix, "/dev-c1-web10/p8080");
        let api = ctrl.caches().app_inst.get(&app_inst("api", "c1").key).unwrap();
        assert_eq!(api.mapped_ports[0].public_port, 10000);

        ctrl.delete_app_inst(app_inst("web", "c1"), &progress).await.unwrap();
        let refs = ctrl.cloudlet_refs(&cloudlet_key()).unwrap();
        assert_eq!(refs.root_lb_ports.keys().copied().collect::<Vec<_>>(), vec![10000]);
    }

    #[tokio::test]
    async fn dedicated_cluster_rejects_overlapping_ports() {
        let ctrl = controller().await;
        seed(&ctrl).await;
        let progress = CollectProgress::new();
        ctrl.create_app(app("web", "tcp:80")).await.unwrap();
        ctrl.create_app(app("api", "tcp:80")).await.unwrap();
        ctrl.create_cluster_inst(cluster("d1", IpAccess::Dedicated), &progress)
            .await
            .unwrap();

        ctrl.create_app_inst(app_inst("web", "d1"), &progress).await.unwrap();
        let web = ctrl.caches().app_inst.get(&app_inst("web", "d1").key).unwrap();
        assert_eq!(web.uri, "d1.edge1.operator.edgegrid.net");
        assert_eq!(web.mapped_ports[0].public_port, 80);

        let err = ctrl
            .create_app_inst(app_inst("api", "d1"), &progress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("port 80 is already in use on the cluster"));
        assert!(ctrl.cloudlet_refs(&cloudlet_key()).unwrap().root_lb_ports.is_empty());

        ctrl.create_app(app("media", "udp:5000-5010,tcp:80")).await.unwrap();
        ctrl.create_app(app("rtp", "udp:5005")).await.unwrap();
        ctrl.create_app_inst(app_inst("rtp", "d1"), &progress).await.unwrap();
        let err = ctrl
            .create_app_inst(app_inst("media", "d1"), &progress)
            .await
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("port range 5000-5010 overlaps with ports in use on the cluster")
        );
    }

    async fn force_app_inst_state(ctrl: &Controller, key: &AppInstKey, state: TrackedState) {
        let mut cur = ctrl.caches().app_inst.get(key).unwrap();
        cur.state = state;
        ctrl.sync()
            .apply_stm_wait(|stm| {
                stm.put(&cur)?;
                Ok::<_, ApiError>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn departing_siblings_free_dedicated_ports() {
        let ctrl = controller().await;
        seed(&ctrl).await;
        let progress = CollectProgress::new();
        for name in ["web", "api", "gw"] {
            ctrl.create_app(app(name, "tcp:80")).await.unwrap();
        }
        ctrl.create_cluster_inst(cluster("d1", IpAccess::Dedicated), &progress)
            .await
            .unwrap();

        ctrl.create_app_inst(app_inst("web", "d1"), &progress).await.unwrap();
        force_app_inst_state(&ctrl, &app_inst("web", "d1").key, TrackedState::DeleteError).await;
        ctrl.create_app_inst(app_inst("api", "d1"), &progress).await.unwrap();

        force_app_inst_state(&ctrl, &app_inst("api", "d1").key, TrackedState::Deleting).await;
        ctrl.create_app_inst(app_inst("gw", "d1"), &progress).await.unwrap();

        // A sibling still being created keeps its claim.
        force_app_inst_state(&ctrl, &app_inst("gw", "d1").key, TrackedState::Creating).await;
        ctrl.create_app(app("extra", "tcp:80")).await.unwrap();
        let err = ctrl
            .create_app_inst(app_inst("extra", "d1"), &progress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("port 80 is already in use on the cluster"));
    }

    #[tokio::test]
    async fn undo_recreate_skips_dedicated_overlap() {
        let ctrl = controller().await;
        seed(&ctrl).await;
        let progress = CollectProgress::new();
        ctrl.create_app(app("web", "tcp:80")).await.unwrap();
        ctrl.create_app(app("api", "tcp:80")).await.unwrap();
        ctrl.create_cluster_inst(cluster("d1", IpAccess::Dedicated), &progress)
            .await
            .unwrap();
        ctrl.create_app_inst(app_inst("web", "d1"), &progress).await.unwrap();

        ctrl.create_app_inst_internal(CallContext::new().with_undo(), app_inst("api", "d1"), &progress)
            .await
            .unwrap();
        let api = ctrl.caches().app_inst.get(&app_inst("api", "d1").key).unwrap();
        assert_eq!(api.state, TrackedState::Ready);
        assert_eq!(api.mapped_ports[0].public_port, 80);
    }

    #[tokio::test]
    async fn bypassed_delete_forgets_ignored_reports() {
        let ctrl = controller().await;
        seed(&ctrl).await;
        let progress = CollectProgress::new();
        ctrl.create_app(app("web", "tcp:80")).await.unwrap();
        ctrl.create_cluster_inst(cluster("c1", IpAccess::Shared), &progress)
            .await
            .unwrap();
        ctrl.create_app_inst(app_inst("web", "c1"), &progress).await.unwrap();
        let late = AppInstInfo {
            key: app_inst("web", "c1").key,
            state: TrackedState::Creating,
            ..Default::default()
        };
        ctrl.app_inst_update_from_info(&late).await.unwrap();
        assert_eq!(ctrl.tracked_ignored_keys(), 1);

        ctrl.delete_app_inst(app_inst("web", "c1"), &progress).await.unwrap();
        assert_eq!(ctrl.tracked_ignored_keys(), 0);
    }

    #[tokio::test]
    async fn cluster_must_exist_and_be_ready() {
        let ctrl = controller().await;
        seed(&ctrl).await;
        ctrl.create_app(app("web", "tcp:80")).await.unwrap();
        let err = ctrl
            .create_app_inst(app_inst("web", "missing"), &CollectProgress::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(ctrl.caches().app_inst.list().is_empty());
    }

    #[tokio::test]
    async fn auto_cluster_lives_and_dies_with_its_app() {
        let ctrl = controller().await;
        seed(&ctrl).await;
        let progress = CollectProgress::new();
        ctrl.create_app(app("web", "tcp:80")).await.unwrap();

        let inst = app_inst("web", "autoclusterweb");
        ctrl.create_app_inst(inst.clone(), &progress).await.unwrap();
        let cluster = ctrl
            .caches()
            .cluster_inst
            .get(&inst.key.cluster_inst_key)
            .unwrap();
        assert!(cluster.auto);
        assert_eq!(cluster.liveness, Liveness::Dynamic);
        assert!(progress.contains("Creating new auto-cluster named autoclusterweb"));

        ctrl.delete_app_inst(inst.clone(), &progress).await.unwrap();
        assert!(!ctrl.caches().cluster_inst.has_key(&inst.key.cluster_inst_key));
        let refs = ctrl.cloudlet_refs(&cloudlet_key()).unwrap();
        assert!(refs.clusters.is_empty());
        assert_eq!(refs.used_ram, 0);
    }

    #[tokio::test]
    async fn failed_app_inst_removes_new_auto_cluster() {
        let ctrl = controller().await;
        seed(&ctrl).await;
        let progress = CollectProgress::new();
        // Port ranges cannot share the root LB, so placement fails after
        // the auto cluster was made.
        ctrl.create_app(app("web", "tcp:9000-9010")).await.unwrap();

        let inst = app_inst("web", "autoclusterweb");
        let err = ctrl.create_app_inst(inst.clone(), &progress).await.unwrap_err();
        assert!(err.to_string().contains("port range not allowed"));
        assert!(!ctrl.caches().cluster_inst.has_key(&inst.key.cluster_inst_key));
        assert!(ctrl.cloudlet_refs(&cloudlet_key()).unwrap().clusters.is_empty());
    }

    #[tokio::test]
    async fn cluster_delete_autodeletes_children() {
        let ctrl = controller().await;
        seed(&ctrl).await;
        let progress = CollectProgress::new();
        let mut sidecar = app("sidecar", "tcp:7000");
        sidecar.del_opt = DeleteType::AutoDelete;
        ctrl.create_app(sidecar).await.unwrap();
        ctrl.create_app(app("web", "tcp:80")).await.unwrap();
        ctrl.create_cluster_inst(cluster("c1", IpAccess::Shared), &progress)
            .await
            .unwrap();
        ctrl.create_app_inst(app_inst("sidecar", "c1"), &progress).await.unwrap();
        ctrl.create_app_inst(app_inst("web", "c1"), &progress).await.unwrap();

        let err = ctrl
            .delete_cluster_inst(cluster("c1", IpAccess::Shared), &progress)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InUse(_)));

        ctrl.delete_app_inst(app_inst("web", "c1"), &progress).await.unwrap();
        ctrl.delete_cluster_inst(cluster("c1", IpAccess::Shared), &progress)
            .await
            .unwrap();
        assert!(progress.contains("Autodeleting AppInst sidecar"));
        assert!(ctrl.caches().app_inst.list().is_empty());
        let refs = ctrl.cloudlet_refs(&cloudlet_key()).unwrap();
        assert!(refs.root_lb_ports.is_empty());
        assert!(refs.clusters.is_empty());
    }
}
