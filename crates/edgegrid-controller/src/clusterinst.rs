//! ClusterInst lifecycle: create, update, delete, and agent reports.

use std::future::Future;
use std::pin::Pin;

use edgegrid_core::{
    App, AppInst, Cloudlet, CloudletRefs, ClusterInst, ClusterInstInfo, ClusterInstKey,
    CrmOverride, DeleteType, Deployment, Flavor, IpAccess, Liveness, ObjKey, TrackedState,
    AUTO_CLUSTER_PREFIX,
};
use edgegrid_sync::Progress;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::alloc;
use crate::call_context::CallContext;
use crate::cloudlet::check_cloudlet_ready;
use crate::controller::Controller;
use crate::error::{ApiError, ApiResult};
use crate::lifecycle::{self, InfoOutcome, Op, ignore_crm, ignore_crm_errors, ignore_transient};

pub(crate) type ApiFuture<'a> = Pin<Box<dyn Future<Output = ApiResult<()>> + Send + 'a>>;

/// Requested changes to an existing ClusterInst.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterInstUpdate {
    pub key: ClusterInstKey,
    pub num_nodes: Option<u32>,
    pub crm_override: CrmOverride,
}

/// Fill in deployment defaults and reject shapes the deployment cannot
/// have.
pub(crate) fn apply_deployment_defaults(inst: &mut ClusterInst) -> ApiResult<()> {
    let deployment = match inst.deployment.unwrap_or(Deployment::Kubernetes) {
        Deployment::Helm => Deployment::Kubernetes,
        other => other,
    };
    match deployment {
        Deployment::Kubernetes | Deployment::Helm => {
            if inst.num_masters == 0 {
                inst.num_masters = 1;
            }
            if inst.num_masters > 1 {
                return Err(ApiError::Invalid(
                    "NumMasters cannot be greater than 1".to_string(),
                ));
            }
        }
        Deployment::Docker => {
            if inst.num_masters != 0 || inst.num_nodes != 0 {
                return Err(ApiError::Invalid(
                    "NumMasters and NumNodes not applicable for deployment type docker"
                        .to_string(),
                ));
            }
            if inst.ip_access == IpAccess::Shared {
                return Err(ApiError::Invalid(
                    "IpAccess must be dedicated for deployment type docker".to_string(),
                ));
            }
            inst.ip_access = IpAccess::Dedicated;
        }
        Deployment::Vm => {
            return Err(ApiError::Invalid(
                "ClusterInst is not needed for deployment type vm".to_string(),
            ));
        }
    }
    inst.deployment = Some(deployment);
    if inst.ip_access == IpAccess::Unknown {
        inst.ip_access = IpAccess::Shared;
    }
    Ok(())
}

impl Controller {
    pub async fn create_cluster_inst(
        &self,
        mut inst: ClusterInst,
        progress: &dyn Progress,
    ) -> ApiResult<()> {
        inst.liveness = Liveness::Static;
        inst.auto = false;
        let stream = self.start_stream::<ClusterInst>(&inst.key, progress).await?;
        let result = self
            .create_cluster_inst_internal(CallContext::new(), inst, &stream)
            .await;
        stream.finish(&result).await;
        result
    }

    pub async fn delete_cluster_inst(
        &self,
        inst: ClusterInst,
        progress: &dyn Progress,
    ) -> ApiResult<()> {
        let stream = self.start_stream::<ClusterInst>(&inst.key, progress).await?;
        let result = self
            .delete_cluster_inst_internal(CallContext::new(), inst, &stream)
            .await;
        stream.finish(&result).await;
        result
    }

    pub fn show_cluster_insts(&self, filter: &ClusterInst) -> Vec<ClusterInst> {
        let mut out = Vec::new();
        let _ = self.caches().cluster_inst.show(filter, |c| {
            out.push(c.clone());
            Ok::<_, ()>(())
        });
        out
    }

    pub async fn cluster_inst_update_from_info(
        &self,
        info: &ClusterInstInfo,
    ) -> ApiResult<InfoOutcome> {
        self.tracked_update_from_info::<ClusterInst, _>(info).await
    }

    pub async fn cluster_inst_replace_error_state(
        &self,
        key: &ClusterInstKey,
        state: TrackedState,
    ) -> ApiResult<()> {
        self.tracked_replace_error_state::<ClusterInst>(key, state)
            .await
    }

    /// AppInsts placed on the cluster.
    pub fn app_insts_on_cluster(&self, key: &ClusterInstKey) -> Vec<AppInst> {
        self.caches()
            .app_inst
            .filtered(|ai| ai.key.cluster_inst_key == *key)
    }

    /// Whether an AppInst that cannot be auto-deleted uses the cluster.
    pub fn cluster_inst_in_use(&self, key: &ClusterInstKey) -> bool {
        self.app_insts_on_cluster(key).iter().any(|ai| {
            self.caches()
                .app
                .get(&ai.key.app_key)
                .is_none_or(|app: App| app.del_opt != DeleteType::AutoDelete)
        })
    }

    pub(crate) fn create_cluster_inst_internal<'a>(
        &'a self,
        cctx: CallContext,
        inst: ClusterInst,
        progress: &'a dyn Progress,
    ) -> ApiFuture<'a> {
        Box::pin(async move {
            let mut cctx = cctx;
            let mut inst = inst;
            cctx.set_override(&mut inst.crm_override);
            inst.key.validate()?;
            if inst.key.is_auto_cluster() && !cctx.auto_cluster && !cctx.undo {
                return Err(ApiError::Invalid(format!(
                    "Cluster name prefix \"{AUTO_CLUSTER_PREFIX}\" is reserved"
                )));
            }
            if inst.flavor.name.is_empty() {
                return Err(ApiError::Invalid("No flavor specified".to_string()));
            }
            apply_deployment_defaults(&mut inst)?;
            if inst.liveness == Liveness::Unknown {
                inst.liveness = Liveness::Dynamic;
            }
            inst.errors.clear();
            inst.status.clear();

            let key = inst.key.clone();
            let mut previous_errors: Option<Vec<String>> = None;
            let mut committed = inst.clone();
            let result = self
                .sync()
                .apply_stm_wait(|stm| {
                    previous_errors = None;
                    let mut obj = inst.clone();
                    if !ignore_crm(&cctx) && !cctx.skip_cloudlet_ready_check {
                        check_cloudlet_ready(stm, &key.cloudlet_key)?;
                    }
                    let existing = stm.get::<ClusterInst>(&key)?;
                    if let Some(existing) = &existing {
                        if !cctx.undo
                            && existing.state != TrackedState::DeleteError
                            && !ignore_transient(&cctx, existing.state)
                        {
                            if existing.state == TrackedState::CreateError {
                                previous_errors = Some(existing.errors.clone());
                            }
                            return Err(ApiError::key_exists::<ClusterInst>(&key));
                        }
                    }
                    let cloudlet = stm
                        .get::<Cloudlet>(&key.cloudlet_key)?
                        .ok_or_else(|| ApiError::not_found::<Cloudlet>(&key.cloudlet_key))?;
                    if cloudlet.platform_type.is_managed_kubernetes()
                        && obj.deployment == Some(Deployment::Docker)
                    {
                        return Err(ApiError::Invalid(format!(
                            "Cloudlet platform {:?} only supports kubernetes clusters",
                            cloudlet.platform_type
                        )));
                    }
                    let flavor = stm.get::<Flavor>(&obj.flavor)?.ok_or_else(|| {
                        ApiError::Invalid(format!("Flavor {} not found", obj.flavor))
                    })?;
                    let mut refs = stm
                        .get::<CloudletRefs>(&key.cloudlet_key)?
                        .unwrap_or_else(|| CloudletRefs::new(key.cloudlet_key.clone()));
                    // Membership in refs.clusters means the reservations are held.
                    // A reused record may change shape, so its old reservation
                    // goes back before the new one is taken.
                    if refs.clusters.contains(&key) {
                        if let Some(old) = &existing {
                            if let Some(old_flavor) = stm.get::<Flavor>(&old.flavor)? {
                                alloc::release_resources(
                                    &mut refs,
                                    &old_flavor,
                                    alloc::node_count(old),
                                );
                            }
                            alloc::free_ip(old, &cloudlet, &mut refs);
                        }
                    } else {
                        refs.clusters.push(key.clone());
                    }
                    obj.allocated_ip.clear();
                    alloc::allocate_ip(&mut obj, &cloudlet, &mut refs)?;
                    alloc::reserve_resources(&mut refs, &flavor, alloc::node_count(&obj));
                    stm.put(&refs)?;
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
                    progress.send("Use DeleteClusterInst to remove and try again");
                }
                return Err(err);
            }
            info!(cluster_inst = %key, state = %committed.state, undo = cctx.undo, "cluster inst committed");
            if ignore_crm(&cctx) {
                return Ok(());
            }

            let timeout = self.settings().timeouts.create_cluster_inst;
            let waited = lifecycle::await_agent(
                &self.caches().cluster_inst,
                &key,
                Op::Create,
                timeout,
                progress,
            )
            .await;
            match waited {
                Ok(()) => Ok(()),
                Err(err) if ignore_crm_errors(&cctx) => {
                    progress.send(&format!("Create ClusterInst ignoring CRM failure: {err}"));
                    self.cluster_inst_replace_error_state(&key, TrackedState::Ready)
                        .await?;
                    progress.send("Created ClusterInst successfully");
                    Ok(())
                }
                Err(err) => {
                    progress.send("DELETING ClusterInst due to failures");
                    if let Err(undo_err) = self
                        .delete_cluster_inst_internal(cctx.with_undo(), committed, progress)
                        .await
                    {
                        error!(cluster_inst = %key, error = %undo_err, "failed to undo cluster inst create");
                        progress.send(&format!("Failed to undo ClusterInst creation: {undo_err}"));
                    }
                    Err(err)
                }
            }
        })
    }

    pub(crate) fn delete_cluster_inst_internal<'a>(
        &'a self,
        cctx: CallContext,
        inst: ClusterInst,
        progress: &'a dyn Progress,
    ) -> ApiFuture<'a> {
        Box::pin(async move {
            let mut cctx = cctx;
            let mut inst = inst;
            cctx.set_override(&mut inst.crm_override);
            let key = inst.key.clone();
            key.validate()?;
            if self.cluster_inst_in_use(&key) {
                return Err(ApiError::InUse(
                    "ClusterInst in use by Application Instance".to_string(),
                ));
            }

            // Park the cluster so nothing new lands on it while children go.
            let mut prev_state = TrackedState::Unknown;
            let mut previous_errors: Option<Vec<String>> = None;
            let parked = self
                .sync()
                .apply_stm_wait(|stm| {
                    previous_errors = None;
                    let mut cur = stm
                        .get::<ClusterInst>(&key)?
                        .ok_or_else(|| ApiError::not_found::<ClusterInst>(&key))?;
                    if cur.state == TrackedState::DeleteError {
                        previous_errors = Some(cur.errors.clone());
                    }
                    lifecycle::check_deletable(&cctx, "ClusterInst", cur.state)?;
                    prev_state = cur.state;
                    cur.state = TrackedState::DeletePrepare;
                    stm.put(&cur)?;
                    Ok(())
                })
                .await;
            if let Err(err) = parked {
                if let Some(errors) = previous_errors {
                    progress.send(&format!("Previous delete failed, {}", errors.join(", ")));
                    progress.send("Use CreateClusterInst to rebuild, and try again");
                }
                return Err(err);
            }

            if let Err(err) = self
                .auto_delete_app_insts(&key, cctx.crm_override, progress)
                .await
            {
                self.restore_cluster_inst_state(&key, prev_state).await;
                return Err(ApiError::InUse(format!(
                    "Failed to auto-delete applications from ClusterInst {}, {err}",
                    key.cluster_key.name
                )));
            }

            let mut released = inst.clone();
            self.sync()
                .apply_stm_wait(|stm| {
                    let mut cur = stm
                        .get::<ClusterInst>(&key)?
                        .ok_or_else(|| ApiError::not_found::<ClusterInst>(&key))?;
                    if cur.state != TrackedState::DeletePrepare {
                        return Err(ApiError::Busy(format!(
                            "ClusterInst expected state DeletePrepare, but is {}",
                            cur.state
                        )));
                    }
                    if let Some(mut refs) = stm.get::<CloudletRefs>(&key.cloudlet_key)? {
                        if let Some(pos) = refs.clusters.iter().position(|k| *k == key) {
                            refs.clusters.remove(pos);
                            if let Some(flavor) = stm.get::<Flavor>(&cur.flavor)? {
                                alloc::release_resources(
                                    &mut refs,
                                    &flavor,
                                    alloc::node_count(&cur),
                                );
                            }
                            if let Some(cloudlet) = stm.get::<Cloudlet>(&key.cloudlet_key)? {
                                alloc::free_ip(&cur, &cloudlet, &mut refs);
                            }
                            stm.put(&refs)?;
                        }
                    }
                    released = cur.clone();
                    if ignore_crm(&cctx) {
                        stm.delete::<ClusterInst>(&key);
                    } else {
                        cur.state = TrackedState::DeleteRequested;
                        stm.put(&cur)?;
                    }
                    Ok(())
                })
                .await?;
            info!(cluster_inst = %key, undo = cctx.undo, "cluster inst delete committed");
            if ignore_crm(&cctx) {
                self.clear_ignored_transitions::<ClusterInst>(&key);
                return Ok(());
            }

            let timeout = self.settings().timeouts.delete_cluster_inst;
            let waited = lifecycle::await_agent(
                &self.caches().cluster_inst,
                &key,
                Op::Delete,
                timeout,
                progress,
            )
            .await;
            match waited {
                Ok(()) => Ok(()),
                Err(err) if ignore_crm_errors(&cctx) => {
                    progress.send(&format!("Delete ClusterInst ignoring CRM failure: {err}"));
                    self.cluster_inst_replace_error_state(&key, TrackedState::NotPresent)
                        .await?;
                    progress.send("Deleted ClusterInst successfully");
                    Ok(())
                }
                Err(err) => {
                    progress.send("Recreating ClusterInst due to failure");
                    released.crm_override = CrmOverride::NoOverride;
                    if let Err(undo_err) = self
                        .create_cluster_inst_internal(cctx.with_undo(), released, progress)
                        .await
                    {
                        error!(cluster_inst = %key, error = %undo_err, "failed to undo cluster inst delete");
                        progress.send(&format!("Failed to undo ClusterInst deletion: {undo_err}"));
                    }
                    Err(err)
                }
            }
        })
    }

    async fn restore_cluster_inst_state(&self, key: &ClusterInstKey, state: TrackedState) {
        let restored = self
            .sync()
            .apply_stm_wait(|stm| {
                if let Some(mut cur) = stm.get::<ClusterInst>(key)? {
                    if cur.state == TrackedState::DeletePrepare {
                        cur.state = state;
                        stm.put(&cur)?;
                    }
                }
                Ok::<_, ApiError>(())
            })
            .await;
        if let Err(e) = restored {
            error!(cluster_inst = %key, error = %e, "failed to restore state after aborted delete");
        }
    }

    /// Delete the auto-deletable AppInsts on a cluster being deleted. An
    /// AppInst that is mid-operation is waited out, then retried.
    async fn auto_delete_app_insts(
        &self,
        key: &ClusterInstKey,
        crm_override: CrmOverride,
        progress: &dyn Progress,
    ) -> ApiResult<()> {
        let mut cctx = CallContext::new();
        // A CRM error on a child must not strand the parent mid-delete.
        cctx.crm_override = match crm_override {
            CrmOverride::NoOverride => CrmOverride::IgnoreCrmErrors,
            other => other,
        };
        cctx.skip_cloudlet_ready_check = true;
        let timeout = self.settings().timeouts.delete_app_inst;

        for app_inst in self.app_insts_on_cluster(key) {
            progress.send(&format!(
                "Autodeleting AppInst {}",
                app_inst.key.app_key.name
            ));
            let deadline = Instant::now() + timeout;
            loop {
                match self
                    .delete_app_inst_internal(cctx, app_inst.clone(), progress)
                    .await
                {
                    Ok(()) | Err(ApiError::NotFound { .. }) => break,
                    Err(ApiError::Busy(msg)) => {
                        let cache = &self.caches().app_inst;
                        let settled = cache
                            .get(&app_inst.key)
                            .is_some_and(|cur| !cur.state.is_transient());
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if settled || remaining.is_zero() {
                            return Err(ApiError::Busy(msg));
                        }
                        debug!(app_inst = %app_inst.key, "waiting for busy AppInst before auto-delete");
                        cache
                            .wait_for(&app_inst.key, remaining, |cur| {
                                cur.is_none_or(|c| !c.state.is_transient())
                            })
                            .await
                            .map_err(|_| ApiError::Busy(msg))?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Change the number of worker nodes. Updates are not rolled back.
    pub async fn update_cluster_inst(
        &self,
        update: ClusterInstUpdate,
        progress: &dyn Progress,
    ) -> ApiResult<()> {
        let mut cctx = CallContext::new();
        let mut requested = update.crm_override;
        cctx.set_override(&mut requested);
        let key = update.key;
        key.validate()?;
        let Some(num_nodes) = update.num_nodes else {
            return Err(ApiError::Invalid("Nothing specified to update".to_string()));
        };

        let mut changed = false;
        let mut previous_errors: Option<Vec<String>> = None;
        self.sync()
            .apply_stm_wait(|stm| {
                changed = false;
                previous_errors = None;
                if !ignore_crm(&cctx) {
                    check_cloudlet_ready(stm, &key.cloudlet_key)?;
                }
                let mut cur = stm
                    .get::<ClusterInst>(&key)?
                    .ok_or_else(|| ApiError::not_found::<ClusterInst>(&key))?;
                if cur.deployment == Some(Deployment::Docker) {
                    return Err(ApiError::Invalid(
                        "Cannot change node count of a docker cluster".to_string(),
                    ));
                }
                if cur.state != TrackedState::Ready && !ignore_transient(&cctx, cur.state) {
                    if cur.state != TrackedState::UpdateError {
                        return Err(ApiError::Busy(format!(
                            "ClusterInst busy ({}), cannot update",
                            cur.state
                        )));
                    }
                    previous_errors = Some(cur.errors.clone());
                }
                if cur.num_nodes == num_nodes {
                    return Ok(());
                }
                let flavor = stm
                    .get::<Flavor>(&cur.flavor)?
                    .ok_or_else(|| ApiError::Invalid(format!("Flavor {} not found", cur.flavor)))?;
                let mut refs = stm
                    .get::<CloudletRefs>(&key.cloudlet_key)?
                    .unwrap_or_else(|| CloudletRefs::new(key.cloudlet_key.clone()));
                alloc::release_resources(&mut refs, &flavor, alloc::node_count(&cur));
                cur.num_nodes = num_nodes;
                alloc::reserve_resources(&mut refs, &flavor, alloc::node_count(&cur));
                stm.put(&refs)?;
                cur.state = if ignore_crm(&cctx) {
                    TrackedState::Ready
                } else {
                    TrackedState::UpdateRequested
                };
                stm.put(&cur)?;
                changed = true;
                Ok(())
            })
            .await?;
        if let Some(errors) = previous_errors {
            progress.send(&format!(
                "Previous update failed, {}, trying again",
                errors.join(", ")
            ));
        }
        if !changed || ignore_crm(&cctx) {
            return Ok(());
        }

        let timeout = self.settings().timeouts.update_cluster_inst;
        match lifecycle::await_agent(
            &self.caches().cluster_inst,
            &key,
            Op::Update,
            timeout,
            progress,
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(err) if ignore_crm_errors(&cctx) => {
                progress.send(&format!("Update ClusterInst ignoring CRM failure: {err}"));
                self.cluster_inst_replace_error_state(&key, TrackedState::Ready)
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
