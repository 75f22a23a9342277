//! Dynamic IP accounting for clusters with dedicated access.

use edgegrid_core::{Cloudlet, CloudletRefs, ClusterInst, IpAccess, IpSupport};

use crate::error::{ApiError, ApiResult};

/// Marker stored in `ClusterInst::allocated_ip` for a counted dynamic IP.
pub const ALLOCATED_IP_DYNAMIC: &str = "dynamic";

/// Reserve an IP for `inst`. Shared access rides on the cloudlet's root
/// load balancer and needs none. One address of the pool is kept back
/// for that load balancer.
pub fn allocate_ip(
    inst: &mut ClusterInst,
    cloudlet: &Cloudlet,
    refs: &mut CloudletRefs,
) -> ApiResult<()> {
    if cloudlet.platform_type.ip_allocated_per_service() {
        // The platform hands out addresses itself.
        inst.ip_access = IpAccess::Dedicated;
        return Ok(());
    }
    if inst.ip_access == IpAccess::Shared {
        return Ok(());
    }
    match cloudlet.ip_support {
        IpSupport::Static => Err(ApiError::Invalid("Static IPs not supported".to_string())),
        IpSupport::Dynamic => {
            if refs.used_dynamic_ips + 1 >= cloudlet.num_dynamic_ips {
                return Err(ApiError::ResourceExhausted(
                    "No more dynamic IPs left".to_string(),
                ));
            }
            refs.used_dynamic_ips += 1;
            inst.allocated_ip = ALLOCATED_IP_DYNAMIC.to_string();
            Ok(())
        }
        IpSupport::Unknown => Err(ApiError::Invalid(format!(
            "Cloudlet {} has no IP support mode",
            cloudlet.key
        ))),
    }
}

pub fn free_ip(inst: &ClusterInst, cloudlet: &Cloudlet, refs: &mut CloudletRefs) {
    if cloudlet.platform_type.ip_allocated_per_service() || inst.ip_access == IpAccess::Shared {
        return;
    }
    if inst.allocated_ip == ALLOCATED_IP_DYNAMIC {
        refs.used_dynamic_ips = (refs.used_dynamic_ips - 1).max(0);
    }
}
