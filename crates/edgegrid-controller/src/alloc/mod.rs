//! Resource accounting on a cloudlet's refs record.
//!
//! Every function here mutates a [`CloudletRefs`] value read inside the
//! caller's transaction attempt and must leave it untouched on error, so
//! a failed allocation aborts the transaction with nothing half-done.

pub mod ip;
pub mod ports;

use edgegrid_core::{CloudletRefs, ClusterInst, Deployment, Flavor};

pub use ip::{allocate_ip, free_ip};
pub use ports::{allocate_shared_ports, release_shared_ports};

/// Number of flavor-sized machines a cluster occupies.
pub fn node_count(inst: &ClusterInst) -> u64 {
    match inst.deployment {
        Some(Deployment::Docker) => 1,
        _ => u64::from(inst.num_masters) + u64::from(inst.num_nodes),
    }
}

pub fn reserve_resources(refs: &mut CloudletRefs, flavor: &Flavor, count: u64) {
    refs.used_ram += flavor.ram_mb * count;
    refs.used_vcores += flavor.vcpus * count;
    refs.used_disk += flavor.disk_gb * count;
}

pub fn release_resources(refs: &mut CloudletRefs, flavor: &Flavor, count: u64) {
    refs.used_ram = refs.used_ram.saturating_sub(flavor.ram_mb * count);
    refs.used_vcores = refs.used_vcores.saturating_sub(flavor.vcpus * count);
    refs.used_disk = refs.used_disk.saturating_sub(flavor.disk_gb * count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_core::{CloudletKey, FlavorKey};

    #[test]
    fn resources_follow_node_count() {
        let flavor = Flavor {
            key: FlavorKey::new("small"),
            ram_mb: 1024,
            vcpus: 2,
            disk_gb: 10,
        };
        let inst = ClusterInst {
            deployment: Some(Deployment::Kubernetes),
            num_masters: 1,
            num_nodes: 2,
            ..Default::default()
        };
        let mut refs = CloudletRefs::new(CloudletKey::new("op", "edge"));
        reserve_resources(&mut refs, &flavor, node_count(&inst));
        assert_eq!((refs.used_ram, refs.used_vcores, refs.used_disk), (3072, 6, 30));

        release_resources(&mut refs, &flavor, 4);
        assert_eq!((refs.used_ram, refs.used_vcores, refs.used_disk), (0, 0, 0));
    }

    #[test]
    fn docker_is_one_machine() {
        let inst = ClusterInst {
            deployment: Some(Deployment::Docker),
            ..Default::default()
        };
        assert_eq!(node_count(&inst), 1);
    }
}
