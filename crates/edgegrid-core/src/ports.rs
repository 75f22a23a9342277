//! Application port declarations, e.g. `tcp:80,udp:5000-5010,http:8080`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Layer-4 protocol class of an exposed port. HTTP is served through the
/// shared L7 front door instead of a dedicated port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LProto {
    #[default]
    Unknown,
    Tcp,
    Udp,
    Http,
}

impl fmt::Display for LProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LProto::Unknown => "unknown",
            LProto::Tcp => "tcp",
            LProto::Udp => "udp",
            LProto::Http => "http",
        };
        f.write_str(s)
    }
}

/// One exposed port of an application instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPort {
    pub proto: LProto,
    pub internal_port: i32,
    /// External port on the load balancer; 0 until allocated.
    pub public_port: i32,
    /// Last port of a range, 0 for a single port.
    #[serde(default)]
    pub end_port: i32,
    /// URL path prefix for HTTP ports multiplexed on the L7 port.
    #[serde(default)]
    pub path_prefix: String,
}

/// Parse a comma separated `proto:port[-end]` list.
pub fn parse_app_ports(spec: &str) -> CoreResult<Vec<AppPort>> {
    let invalid = |reason: String| CoreError::InvalidPorts {
        ports: spec.to_string(),
        reason,
    };

    let mut ports = Vec::new();
    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (proto, range) = item
            .split_once(':')
            .ok_or_else(|| invalid(format!("{item} is not proto:port")))?;
        let proto = match proto.to_ascii_lowercase().as_str() {
            "tcp" => LProto::Tcp,
            "udp" => LProto::Udp,
            "http" => LProto::Http,
            other => return Err(invalid(format!("unsupported protocol {other}"))),
        };
        let (start, end) = match range.split_once('-') {
            Some((a, b)) => (parse_port(a).map_err(&invalid)?, parse_port(b).map_err(&invalid)?),
            None => (parse_port(range).map_err(&invalid)?, 0),
        };
        if end != 0 && end <= start {
            return Err(invalid(format!("range {start}-{end} is empty")));
        }
        if end != 0 && proto == LProto::Http {
            return Err(invalid("http ports cannot be ranges".to_string()));
        }
        ports.push(AppPort {
            proto,
            internal_port: start,
            public_port: 0,
            end_port: end,
            path_prefix: String::new(),
        });
    }
    Ok(ports)
}

fn parse_port(s: &str) -> Result<i32, String> {
    let port: i32 = s
        .trim()
        .parse()
        .map_err(|_| format!("{s} is not a port number"))?;
    if !(1..=65535).contains(&port) {
        return Err(format!("port {port} out of range"));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_list() {
        let ports = parse_app_ports("tcp:80, udp:5000-5010,http:8080").unwrap();
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[0].proto, LProto::Tcp);
        assert_eq!(ports[0].internal_port, 80);
        assert_eq!(ports[1].end_port, 5010);
        assert_eq!(ports[2].proto, LProto::Http);
    }

    #[test]
    fn empty_list_is_ok() {
        assert!(parse_app_ports("").unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_entries() {
        assert!(parse_app_ports("sctp:80").is_err());
        assert!(parse_app_ports("tcp:0").is_err());
        assert!(parse_app_ports("tcp:90-80").is_err());
        assert!(parse_app_ports("http:80-90").is_err());
        assert!(parse_app_ports("tcp80").is_err());
    }
}
