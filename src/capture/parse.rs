//! Parser for tcpdump `-nn -l -q -tt` output lines.
//!
//! Example inputs:
//! ```text
//! 1700000000.123456 IP 192.168.1.10.51000 > 203.0.113.5.443: tcp 1500
//! 1700000000.123456 IP6 2001:db8::1.53 > 2001:db8::2.40000: UDP, length 120
//! 1700000000.123456 eth0 Out IP 192.168.1.10 > 8.8.8.8: ICMP echo request, id 1, seq 1, length 64
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;

use crate::flow::record::Protocol;

static LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)IP6?\s+(\S+)\s+>\s+(\S+):(?:\s+(.*))?$").expect("valid capture line regex")
});
static LENGTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:length|len)\s+(\d+)").expect("valid length regex"));
static QUIET_LENGTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:tcp|udp)\s+(\d+)").expect("valid quiet length regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPacket {
    pub src: IpAddr,
    pub src_port: Option<u16>,
    pub dst: IpAddr,
    pub dst_port: Option<u16>,
    pub length: u64,
    pub protocol: Protocol,
}

fn parse_host(host: &str) -> Option<IpAddr> {
    let host = host.split('%').next()?;
    host.parse().ok()
}

/// Splits `addr.port`. A token that is already a bare address has no port.
pub fn split_endpoint(token: &str) -> Option<(IpAddr, Option<u16>)> {
    let token = token.trim_end_matches(':');
    if let Ok(ip) = token.parse() {
        return Some((ip, None));
    }
    if let Some((host, zone)) = token.split_once('%') {
        if !zone.contains('.') {
            return host.parse().ok().map(|ip| (ip, None));
        }
    }
    let (host, port) = token.rsplit_once('.')?;
    let ip = parse_host(host)?;
    Some((ip, port.parse().ok()))
}

/// Packet length from `length N`/`len N`, else the `tcp N`/`udp N` form.
fn parse_length(remainder: &str) -> Option<u64> {
    LENGTH_RE
        .captures(remainder)
        .or_else(|| QUIET_LENGTH_RE.captures(remainder))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parses one capture line. Returns `None` for anything that is not an IP
/// packet summary with a length.
pub fn parse_line(line: &str) -> Option<ParsedPacket> {
    let caps = LINE_RE.captures(line.trim_end())?;
    let (src, src_port) = split_endpoint(caps.get(1)?.as_str())?;
    let (dst, dst_port) = split_endpoint(caps.get(2)?.as_str())?;
    let remainder = caps.get(3).map(|m| m.as_str()).unwrap_or("");
    let length = parse_length(remainder)?;

    Some(ParsedPacket {
        src,
        src_port,
        dst,
        dst_port,
        length,
        protocol: Protocol::from_remainder(remainder),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_quiet_tcp_line() {
        let p = parse_line("1700000000.123456 IP 192.168.1.10.51000 > 203.0.113.5.443: tcp 1500")
            .unwrap();
        assert_eq!(p.src, ip("192.168.1.10"));
        assert_eq!(p.src_port, Some(51000));
        assert_eq!(p.dst, ip("203.0.113.5"));
        assert_eq!(p.dst_port, Some(443));
        assert_eq!(p.length, 1500);
        assert_eq!(p.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_ipv6_udp_line() {
        let p = parse_line(
            "1700000000.5 IP6 2001:db8::1.53 > 2001:db8::2.40000: UDP, length 120",
        )
        .unwrap();
        assert_eq!(p.src, ip("2001:db8::1"));
        assert_eq!(p.src_port, Some(53));
        assert_eq!(p.dst_port, Some(40000));
        assert_eq!(p.length, 120);
        assert_eq!(p.protocol, Protocol::Udp);
    }

    #[test]
    fn test_icmp_without_ports_and_direction_tokens() {
        let p = parse_line(
            "1700000000.1 eth0 Out IP 192.168.1.10 > 8.8.8.8: ICMP echo request, id 1, seq 1, length 64",
        )
        .unwrap();
        assert_eq!(p.src, ip("192.168.1.10"));
        assert_eq!(p.src_port, None);
        assert_eq!(p.dst, ip("8.8.8.8"));
        assert_eq!(p.dst_port, None);
        assert_eq!(p.length, 64);
        assert_eq!(p.protocol, Protocol::Icmp);
    }

    #[test]
    fn test_zone_suffix_stripped() {
        let p = parse_line("1.0 IP6 fe80::1%eth0.546 > ff02::1:2.547: UDP, length 90").unwrap();
        assert_eq!(p.src, ip("fe80::1"));
        assert_eq!(p.src_port, Some(546));
        assert_eq!(p.dst, ip("ff02::1:2"));
        assert_eq!(split_endpoint("fe80::1%eth0"), Some((ip("fe80::1"), None)));
    }

    #[test]
    fn test_unparsable_lines() {
        assert!(parse_line("").is_none());
        assert!(parse_line("tcpdump: verbose output suppressed").is_none());
        assert!(parse_line("1.0 ARP, Request who-has 192.168.1.1 tell 192.168.1.10, length 28").is_none());
        // no length anywhere
        assert!(parse_line("1.0 IP 10.0.0.1.1 > 10.0.0.2.2: Flags [S]").is_none());
    }

    #[test]
    fn test_split_endpoint() {
        assert_eq!(split_endpoint("10.0.0.1"), Some((ip("10.0.0.1"), None)));
        assert_eq!(split_endpoint("10.0.0.1.80"), Some((ip("10.0.0.1"), Some(80))));
        assert_eq!(split_endpoint("::1.22"), Some((ip("::1"), Some(22))));
        assert_eq!(split_endpoint("garbage"), None);
    }
}
