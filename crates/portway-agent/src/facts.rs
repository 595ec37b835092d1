//! System facts for the connection request

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use portway_proto::ConnectionRequest;

/// Best-effort primary address of the given family, found by addressing a
/// datagram socket at a public address. Nothing is sent.
fn local_addr_of(probe: SocketAddr) -> Option<IpAddr> {
    let bind: SocketAddr = match probe {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(probe).ok()?;
    let local = socket.local_addr().ok()?;
    (!local.ip().is_loopback() && !local.ip().is_unspecified()).then(|| local.ip())
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Fill identity and system facts; the caller sets id, name, tags and
/// remotes.
pub fn connection_request() -> ConnectionRequest {
    let v4_probe = SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 53));
    let v6_probe = SocketAddr::from((Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), 53));
    let ipv4 = local_addr_of(v4_probe)
        .map(|ip| vec![ip.to_string()])
        .unwrap_or_default();
    let ipv6 = local_addr_of(v6_probe)
        .map(|ip| vec![ip.to_string()])
        .unwrap_or_default();

    ConnectionRequest {
        hostname: hostname(),
        os: std::env::consts::OS.to_string(),
        os_arch: std::env::consts::ARCH.to_string(),
        os_family: std::env::consts::FAMILY.to_string(),
        os_kernel: std::env::consts::OS.to_string(),
        num_cpus: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(0),
        timezone: std::env::var("TZ").unwrap_or_default(),
        ipv4,
        ipv6,
        version: env!("CARGO_PKG_VERSION").to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facts_are_populated() {
        let req = connection_request();
        assert!(!req.hostname.is_empty());
        assert!(!req.os.is_empty());
        assert!(!req.os_arch.is_empty());
        assert!(!req.version.is_empty());
    }

    #[test]
    fn facts_serialize_with_empty_arrays() {
        let mut req = connection_request();
        req.ipv4.clear();
        req.ipv6.clear();
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["ipv4"], serde_json::json!([]));
        assert_eq!(json["tags"], serde_json::json!([]));
    }
}
