//! Cloudlet registration and agent-reported cloudlet state.

use edgegrid_core::{
    AppInst, Cloudlet, CloudletInfo, CloudletKey, CloudletRefs, CloudletState, ObjKey,
};
use edgegrid_store::{Stm, StoreError};
use tracing::{info, warn};

use crate::controller::Controller;
use crate::error::{ApiError, ApiResult};

/// Fail unless the agent for `key` reports the cloudlet ready.
pub(crate) fn check_cloudlet_ready(stm: &mut Stm<'_>, key: &CloudletKey) -> ApiResult<()> {
    let state = stm
        .get::<CloudletInfo>(key)?
        .map_or(CloudletState::Unknown, |info| info.state);
    if state != CloudletState::Ready {
        return Err(ApiError::CloudletNotReady(format!(
            "Cloudlet {key} not ready, state is {state:?}"
        )));
    }
    Ok(())
}

impl Controller {
    /// Register a cloudlet together with its empty refs record.
    pub async fn create_cloudlet(&self, cloudlet: Cloudlet) -> ApiResult<()> {
        cloudlet.key.validate()?;
        self.sync()
            .apply_stm_wait(|stm| {
                if stm.exists::<Cloudlet>(&cloudlet.key)? {
                    return Err(ApiError::key_exists::<Cloudlet>(&cloudlet.key));
                }
                stm.put(&cloudlet)?;
                if !stm.exists::<CloudletRefs>(&cloudlet.key)? {
                    stm.put(&CloudletRefs::new(cloudlet.key.clone()))?;
                }
                Ok(())
            })
            .await?;
        info!(cloudlet = %cloudlet.key, platform = ?cloudlet.platform_type, "cloudlet created");
        Ok(())
    }

    /// Remove a cloudlet that nothing is placed on.
    pub async fn delete_cloudlet(&self, key: &CloudletKey) -> ApiResult<()> {
        let app_insts = self
            .caches()
            .app_inst
            .filtered(|ai| ai.key.cloudlet_key() == key)
            .len();
        if app_insts > 0 {
            return Err(ApiError::InUse(format!(
                "Cloudlet {key} in use by {app_insts} AppInst(s)"
            )));
        }
        self.sync()
            .apply_stm_wait(|stm| {
                if !stm.exists::<Cloudlet>(key)? {
                    return Err(ApiError::not_found::<Cloudlet>(key));
                }
                if let Some(refs) = stm.get::<CloudletRefs>(key)? {
                    if !refs.clusters.is_empty() {
                        return Err(ApiError::InUse(format!(
                            "Cloudlet {key} in use by ClusterInst {}",
                            refs.clusters[0]
                        )));
                    }
                }
                stm.delete::<Cloudlet>(key);
                stm.delete::<CloudletRefs>(key);
                stm.delete::<CloudletInfo>(key);
                Ok(())
            })
            .await?;
        info!(cloudlet = %key, "cloudlet deleted");
        Ok(())
    }

    pub fn show_cloudlets(&self, filter: &Cloudlet) -> Vec<Cloudlet> {
        let mut out = Vec::new();
        let _ = self.caches().cloudlet.show(filter, |c| {
            out.push(c.clone());
            Ok::<_, ()>(())
        });
        out
    }

    pub fn cloudlet_refs(&self, key: &CloudletKey) -> Option<CloudletRefs> {
        self.caches().cloudlet_refs.get(key)
    }

    /// Persist a cloudlet report from an agent. Reports for unknown
    /// cloudlets are dropped.
    pub async fn update_cloudlet_info(&self, report: CloudletInfo) -> ApiResult<()> {
        let mut known = true;
        self.sync()
            .apply_stm_wait(|stm| {
                known = stm.exists::<Cloudlet>(&report.key)?;
                if known {
                    stm.put(&report)?;
                }
                Ok::<_, ApiError>(())
            })
            .await?;
        if !known {
            warn!(cloudlet = %report.key, "dropping info for unknown cloudlet");
        }
        Ok(())
    }

    /// Mark the cloudlet offline after its agent connection went away,
    /// unless a newer connection has reported since.
    pub async fn cloudlet_info_offline(&self, key: &CloudletKey, notify_id: u64) -> ApiResult<()> {
        self.sync()
            .apply_stm_wait(|stm| {
                if let Some(mut report) = stm.get::<CloudletInfo>(key)? {
                    if report.notify_id == notify_id && report.state != CloudletState::Offline {
                        report.state = CloudletState::Offline;
                        report.status = "agent disconnected".to_string();
                        stm.put(&report)?;
                    }
                }
                Ok::<_, StoreError>(())
            })
            .await?;
        Ok(())
    }

    /// AppInsts placed on `key`, from the cache.
    pub fn app_insts_on_cloudlet(&self, key: &CloudletKey) -> Vec<AppInst> {
        self.caches()
            .app_inst
            .filtered(|ai| ai.key.cloudlet_key() == key)
    }
}
