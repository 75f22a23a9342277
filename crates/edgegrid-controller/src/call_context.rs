use edgegrid_core::CrmOverride;

/// Per-call flags threaded through the lifecycle operations. Never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallContext {
    /// This call rolls back an earlier failed operation and must not
    /// trigger another rollback.
    pub undo: bool,
    pub crm_override: CrmOverride,
    /// This call creates or removes an implicit dependency.
    pub auto_cluster: bool,
    pub skip_cloudlet_ready_check: bool,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_undo(&self) -> Self {
        Self { undo: true, ..*self }
    }

    pub fn with_auto_cluster(&self) -> Self {
        Self {
            auto_cluster: true,
            ..*self
        }
    }

    /// Take the override out of a request object so it is never persisted.
    pub fn set_override(&mut self, requested: &mut CrmOverride) {
        if *requested != CrmOverride::NoOverride {
            self.crm_override = *requested;
            *requested = CrmOverride::NoOverride;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_override_consumes_request_value() {
        let mut cctx = CallContext::new();
        let mut requested = CrmOverride::IgnoreCrm;
        cctx.set_override(&mut requested);
        assert_eq!(cctx.crm_override, CrmOverride::IgnoreCrm);
        assert_eq!(requested, CrmOverride::NoOverride);

        // An empty request keeps the context's override.
        cctx.set_override(&mut requested);
        assert_eq!(cctx.crm_override, CrmOverride::IgnoreCrm);
    }

    #[test]
    fn derived_contexts_keep_other_flags() {
        let cctx = CallContext {
            crm_override: CrmOverride::IgnoreCrmErrors,
            ..Default::default()
        };
        let undo = cctx.with_undo().with_auto_cluster();
        assert!(undo.undo && undo.auto_cluster);
        assert_eq!(undo.crm_override, CrmOverride::IgnoreCrmErrors);
        assert!(!cctx.undo);
    }
}
