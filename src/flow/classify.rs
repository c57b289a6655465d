//! Direction classification and address scope checks.

use ahash::AHashSet as HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::record::{Direction, FlowKey};
use crate::capture::parse::ParsedPacket;

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
        || a >= 240)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_public_v4(v4);
    }
    let first = ip.segments()[0];
    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80)
}

/// True for addresses worth attributing and geolocating. Documentation
/// ranges count as public.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => is_public_v6(v6),
    }
}

/// The host's own addresses, shared between the attributor refresh loop
/// (writer) and the aggregator (reader).
#[derive(Clone, Default)]
pub struct LocalAddrs {
    inner: Arc<RwLock<HashSet<IpAddr>>>,
}

impl LocalAddrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_addrs(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        let local = Self::new();
        local.replace(addrs.into_iter().collect());
        local
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(ip)
    }

    pub fn replace(&self, addrs: HashSet<IpAddr>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = addrs;
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enumerates interface addresses via getifaddrs. Loopback addresses
    /// are always included.
    pub fn discover() -> HashSet<IpAddr> {
        let mut out: HashSet<IpAddr> = [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ]
        .into_iter()
        .collect();

        match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => {
                for ifa in addrs {
                    let Some(addr) = ifa.address else { continue };
                    if let Some(sin) = addr.as_sockaddr_in() {
                        out.insert(IpAddr::V4(sin.ip()));
                    } else if let Some(sin6) = addr.as_sockaddr_in6() {
                        out.insert(IpAddr::V6(sin6.ip()));
                    }
                }
            }
            Err(e) => debug!("getifaddrs failed: {}", e),
        }
        out
    }
}

/// A packet assigned to a flow key.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub key: FlowKey,
    pub remote_port: Option<u16>,
    pub local_port: Option<u16>,
}

/// Decides direction. Returns `None` when neither side is local, both are,
/// or the remote side is not public.
pub fn classify(packet: &ParsedPacket, local: &LocalAddrs) -> Option<Classified> {
    let src_local = local.contains(&packet.src);
    let dst_local = local.contains(&packet.dst);

    let (direction, remote_ip, remote_port, local_port) = match (src_local, dst_local) {
        (true, false) => (
            Direction::Outbound,
            packet.dst,
            packet.dst_port,
            packet.src_port,
        ),
        (false, true) => (
            Direction::Inbound,
            packet.src,
            packet.src_port,
            packet.dst_port,
        ),
        _ => return None,
    };

    if !is_public_ip(remote_ip) {
        return None;
    }

    Some(Classified {
        key: FlowKey {
            direction,
            remote_ip,
        },
        remote_port,
        local_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::record::Protocol;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn packet(src: &str, dst: &str) -> ParsedPacket {
        ParsedPacket {
            src: ip(src),
            src_port: Some(40000),
            dst: ip(dst),
            dst_port: Some(443),
            length: 100,
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn test_public_ranges() {
        assert!(is_public_ip(ip("8.8.8.8")));
        assert!(is_public_ip(ip("203.0.113.5")));
        assert!(is_public_ip(ip("198.51.100.9")));
        assert!(is_public_ip(ip("2001:db8::1")));
        assert!(is_public_ip(ip("2606:4700::1111")));
    }

    #[test]
    fn test_non_public_ranges() {
        for s in [
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.1.1",
            "100.64.0.1",
            "100.127.255.254",
            "224.0.0.251",
            "255.255.255.255",
            "0.0.0.0",
            "::1",
            "::",
            "fe80::1",
            "fd00::1",
            "ff02::fb",
            "::ffff:192.168.1.1",
        ] {
            assert!(!is_public_ip(ip(s)), "{s} should not be public");
        }
        assert!(is_public_ip(ip("100.128.0.1")));
    }

    #[test]
    fn test_classify_directions() {
        let local = LocalAddrs::from_addrs([ip("192.168.1.10")]);

        let out = classify(&packet("192.168.1.10", "203.0.113.5"), &local).unwrap();
        assert_eq!(out.key.direction, Direction::Outbound);
        assert_eq!(out.key.remote_ip, ip("203.0.113.5"));
        assert_eq!(out.remote_port, Some(443));
        assert_eq!(out.local_port, Some(40000));

        let inbound = classify(&packet("198.51.100.9", "192.168.1.10"), &local).unwrap();
        assert_eq!(inbound.key.direction, Direction::Inbound);
        assert_eq!(inbound.key.remote_ip, ip("198.51.100.9"));
        assert_eq!(inbound.remote_port, Some(40000));
    }

    #[test]
    fn test_classify_rejects_private_and_unrelated() {
        let local = LocalAddrs::from_addrs([ip("192.168.1.10")]);
        // remote is private
        assert!(classify(&packet("192.168.1.10", "192.168.1.1"), &local).is_none());
        // neither side local
        assert!(classify(&packet("203.0.113.5", "198.51.100.9"), &local).is_none());
        // both local
        let both = LocalAddrs::from_addrs([ip("192.168.1.10"), ip("203.0.113.1")]);
        assert!(classify(&packet("192.168.1.10", "203.0.113.1"), &both).is_none());
    }

    #[test]
    fn test_discover_includes_loopback() {
        let addrs = LocalAddrs::discover();
        assert!(addrs.contains(&ip("127.0.0.1")));
    }
}
