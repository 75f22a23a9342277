//! Shared load-balancer port allocation.
//!
//! `CloudletRefs::root_lb_ports` maps an external port to a bitmask of the
//! protocols using it, so TCP and UDP may share a number. HTTP ports are
//! not given their own number; they are multiplexed on the L7 port and
//! told apart by path prefix.

use std::collections::BTreeMap;

use edgegrid_core::{AppPort, CloudletRefs, LProto};

use crate::error::{ApiError, ApiResult};

pub const SSH_PORT: i32 = 22;
pub const ROOT_LB_L7_PORT: i32 = 443;
pub const PROXY_METRICS_PORT: i32 = 65121;
pub const SHARED_PORT_BEGIN: i32 = 10000;
pub const SHARED_PORT_END: i32 = 65000;

pub const PROTO_TCP: i32 = 1;
pub const PROTO_UDP: i32 = 2;

pub fn protocol_bits(proto: LProto) -> i32 {
    match proto {
        LProto::Tcp | LProto::Http => PROTO_TCP,
        LProto::Udp => PROTO_UDP,
        LProto::Unknown => 0,
    }
}

pub fn is_reserved(port: i32) -> bool {
    matches!(port, SSH_PORT | ROOT_LB_L7_PORT | PROXY_METRICS_PORT)
}

pub fn protocol_in_use(ports: &BTreeMap<i32, i32>, port: i32, bits: i32) -> bool {
    ports.get(&port).is_some_and(|used| used & bits != 0)
}

fn port_free(ports: &BTreeMap<i32, i32>, port: i32, bits: i32) -> bool {
    !is_reserved(port) && !protocol_in_use(ports, port, bits)
}

/// Assign public ports on the shared load balancer. HTTP ports get the L7
/// port and a path prefix under `path_base`; others reuse their internal
/// number if free, else the first free port from [`SHARED_PORT_BEGIN`].
pub fn allocate_shared_ports(
    refs: &mut CloudletRefs,
    ports: &mut [AppPort],
    path_base: &str,
) -> ApiResult<()> {
    let mut used = refs.root_lb_ports.clone();
    for port in ports.iter_mut() {
        if port.proto == LProto::Http {
            port.public_port = ROOT_LB_L7_PORT;
            port.path_prefix = format!("{path_base}/p{}", port.internal_port);
            continue;
        }
        if port.end_port != 0 {
            return Err(ApiError::Invalid(
                "Shared IP access with port range not allowed".to_string(),
            ));
        }
        let bits = protocol_bits(port.proto);
        let public = if port_free(&used, port.internal_port, bits) {
            port.internal_port
        } else {
            (SHARED_PORT_BEGIN..SHARED_PORT_END)
                .find(|&p| port_free(&used, p, bits))
                .ok_or_else(|| {
                    ApiError::ResourceExhausted("no free external ports found".to_string())
                })?
        };
        port.public_port = public;
        *used.entry(public).or_insert(0) |= bits;
    }
    refs.root_lb_ports = used;
    Ok(())
}

/// Give back the load-balancer ports held by `ports`.
pub fn release_shared_ports(refs: &mut CloudletRefs, ports: &[AppPort]) {
    for port in ports {
        if port.proto == LProto::Http || port.public_port == 0 {
            continue;
        }
        let bits = protocol_bits(port.proto);
        if let Some(used) = refs.root_lb_ports.get_mut(&port.public_port) {
            *used &= !bits;
            if *used == 0 {
                refs.root_lb_ports.remove(&port.public_port);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_core::{CloudletKey, parse_app_ports};

    fn refs() -> CloudletRefs {
        CloudletRefs::new(CloudletKey::new("op", "edge"))
    }

    #[test]
    fn reuses_internal_number_when_free() {
        let mut refs = refs();
        let mut ports = parse_app_ports("tcp:8080,udp:8080").unwrap();
        allocate_shared_ports(&mut refs, &mut ports, "/app").unwrap();
        assert_eq!(ports[0].public_port, 8080);
        assert_eq!(ports[1].public_port, 8080);
        assert_eq!(refs.root_lb_ports[&8080], PROTO_TCP | PROTO_UDP);
    }

    #[test]
    fn conflicting_and_reserved_ports_move_to_shared_range() {
        let mut refs = refs();
        refs.root_lb_ports.insert(8080, PROTO_TCP);
        refs.root_lb_ports.insert(SHARED_PORT_BEGIN, PROTO_TCP);
        let mut ports = parse_app_ports("tcp:8080,tcp:22,udp:8080").unwrap();
        allocate_shared_ports(&mut refs, &mut ports, "/app").unwrap();
        assert_eq!(ports[0].public_port, SHARED_PORT_BEGIN + 1);
        assert_eq!(ports[1].public_port, SHARED_PORT_BEGIN + 2);
        assert_eq!(ports[2].public_port, 8080);
    }

    #[test]
    fn http_goes_to_l7_port() {
        let mut refs = refs();
        refs.root_lb_ports.insert(8080, PROTO_TCP);
        let mut ports = parse_app_ports("http:8080").unwrap();
        allocate_shared_ports(&mut refs, &mut ports, "/dev-c1-web10").unwrap();
        assert_eq!(ports[0].public_port, ROOT_LB_L7_PORT);
        assert_eq!(ports[0].path_prefix, "/dev-c1-web10/p8080");
        assert_eq!(refs.root_lb_ports.len(), 1);
    }

    #[test]
    fn failure_leaves_refs_untouched() {
        let mut refs = refs();
        let mut ports = parse_app_ports("tcp:80,tcp:9000-9010").unwrap();
        assert!(allocate_shared_ports(&mut refs, &mut ports, "/app").is_err());
        assert!(refs.root_lb_ports.is_empty());
    }

    #[test]
    fn exhaustion() {
        let mut refs = refs();
        for p in SHARED_PORT_BEGIN..SHARED_PORT_END {
            refs.root_lb_ports.insert(p, PROTO_TCP);
        }
        refs.root_lb_ports.insert(80, PROTO_TCP);
        let mut ports = parse_app_ports("tcp:80").unwrap();
        let err = allocate_shared_ports(&mut refs, &mut ports, "/app").unwrap_err();
        assert_eq!(err.to_string(), "no free external ports found");

        // UDP still has the whole range.
        let mut ports = parse_app_ports("udp:80").unwrap();
        allocate_shared_ports(&mut refs, &mut ports, "/app").unwrap();
        assert_eq!(ports[0].public_port, 80);
    }

    #[test]
    fn release_clears_only_own_protocol() {
        let mut refs = refs();
        let mut tcp = parse_app_ports("tcp:7000").unwrap();
        let mut udp = parse_app_ports("udp:7000").unwrap();
        allocate_shared_ports(&mut refs, &mut tcp, "/a").unwrap();
        allocate_shared_ports(&mut refs, &mut udp, "/b").unwrap();

        release_shared_ports(&mut refs, &tcp);
        assert_eq!(refs.root_lb_ports[&7000], PROTO_UDP);
        release_shared_ports(&mut refs, &udp);
        assert!(refs.root_lb_ports.is_empty());
    }
}
