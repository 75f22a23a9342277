//! Flavors and app definitions: the inputs instances are built from.

use edgegrid_core::{App, AppKey, Flavor, FlavorKey, ObjKey, parse_app_ports};
use tracing::info;

use crate::controller::Controller;
use crate::error::{ApiError, ApiResult};

impl Controller {
    pub async fn create_flavor(&self, flavor: Flavor) -> ApiResult<()> {
        flavor.key.validate()?;
        self.sync()
            .apply_stm_wait(|stm| {
                if stm.exists::<Flavor>(&flavor.key)? {
                    return Err(ApiError::key_exists::<Flavor>(&flavor.key));
                }
                stm.put(&flavor)?;
                Ok(())
            })
            .await?;
        info!(flavor = %flavor.key, "flavor created");
        Ok(())
    }

    /// Delete a flavor no app or cluster refers to. Released reservations
    /// are computed from the flavor, so it must outlive its users.
    pub async fn delete_flavor(&self, key: &FlavorKey) -> ApiResult<()> {
        let caches = self.caches();
        if caches.app.filtered(|a| a.default_flavor == *key).len()
            + caches.cluster_inst.filtered(|c| c.flavor == *key).len()
            + caches.app_inst.filtered(|ai| ai.flavor == *key).len()
            > 0
        {
            return Err(ApiError::InUse(format!("Flavor {key} in use")));
        }
        self.sync()
            .apply_stm_wait(|stm| {
                if !stm.exists::<Flavor>(key)? {
                    return Err(ApiError::not_found::<Flavor>(key));
                }
                stm.delete::<Flavor>(key);
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub fn show_flavors(&self, filter: &Flavor) -> Vec<Flavor> {
        let mut out = Vec::new();
        let _ = self.caches().flavor.show(filter, |f| {
            out.push(f.clone());
            Ok::<_, ()>(())
        });
        out
    }

    pub async fn create_app(&self, app: App) -> ApiResult<()> {
        app.key.validate()?;
        parse_app_ports(&app.access_ports)?;
        self.sync()
            .apply_stm_wait(|stm| {
                if stm.exists::<App>(&app.key)? {
                    return Err(ApiError::key_exists::<App>(&app.key));
                }
                if !stm.exists::<Flavor>(&app.default_flavor)? {
                    return Err(ApiError::Invalid(format!(
                        "Flavor {} not found",
                        app.default_flavor
                    )));
                }
                stm.put(&app)?;
                Ok(())
            })
            .await?;
        info!(app = %app.key, deployment = %app.deployment, "app created");
        Ok(())
    }

    pub async fn delete_app(&self, key: &AppKey) -> ApiResult<()> {
        if !self
            .caches()
            .app_inst
            .filtered(|ai| ai.key.app_key == *key)
            .is_empty()
        {
            return Err(ApiError::InUse(format!(
                "Application {key} in use by AppInst"
            )));
        }
        self.sync()
            .apply_stm_wait(|stm| {
                if !stm.exists::<App>(key)? {
                    return Err(ApiError::not_found::<App>(key));
                }
                stm.delete::<App>(key);
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub fn show_apps(&self, filter: &App) -> Vec<App> {
        let mut out = Vec::new();
        let _ = self.caches().app.show(filter, |a| {
            out.push(a.clone());
            Ok::<_, ()>(())
        });
        out
    }
}
