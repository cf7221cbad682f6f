// network/mod.rs - Capture, decoding and reassembly of TCP traffic
use log::{debug, warn};
use std::collections::HashSet;
use std::net::IpAddr;

pub mod capture;
pub mod dpi;
pub mod link_layer;
pub mod parser;
pub mod reassembly;

/// All addresses assigned to local interfaces
pub fn local_addresses() -> HashSet<IpAddr> {
    let mut local_ips = HashSet::new();
    for iface in pnet_datalink::interfaces() {
        for ip_network in iface.ips {
            local_ips.insert(ip_network.ip());
        }
    }

    if local_ips.is_empty() {
        warn!(
            "Could not determine any local IP addresses. Connection direction might be inaccurate."
        );
    } else {
        debug!("Found local IPs: {:?}", local_ips);
    }
    local_ips
}

/// RFC 1918 / unique local / loopback / link local
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_private_ip() {
        assert!(is_private_ip(&"10.1.2.3".parse().unwrap()));
        assert!(is_private_ip(&"192.168.0.1".parse().unwrap()));
        assert!(is_private_ip(&"fd00::1".parse().unwrap()));
        assert!(is_private_ip(&"fe80::1".parse().unwrap()));
        assert!(!is_private_ip(&"8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip(&"2001:4860::8888".parse().unwrap()));
    }
}
