//! Point-in-time socket table with owning process names.
//!
//! Sockets come from `/proc/net/{tcp,tcp6,udp,udp6}`; owners are found by
//! matching socket inodes against the `/proc/<pid>/fd` symlinks.

use ahash::AHashMap as HashMap;
use rayon::prelude::*;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::scanner::{collect_proc_entries, read_process_name};
use crate::flow::record::{Direction, Protocol};

const TCP_LISTEN: &str = "0A";

/// One socket from /proc/net/*.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketEntry {
    pub protocol: Protocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub listening: bool,
    pub inode: u64,
}

/// A socket together with the process that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedSocket {
    pub socket: SocketEntry,
    pub process: String,
}

/// What the flow aggregator knows about a remote endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionQuery {
    pub direction: Direction,
    pub remote_ip: IpAddr,
    pub remote_port: Option<u16>,
    pub local_port: Option<u16>,
    pub protocol: Protocol,
}

#[derive(Debug, Default)]
pub struct ConnectionTable {
    sockets: Vec<OwnedSocket>,
}

impl ConnectionTable {
    pub fn new(sockets: Vec<OwnedSocket>) -> Self {
        Self { sockets }
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Finds the most likely owner: an exact remote endpoint match, then
    /// (inbound only) a listener on the local port, then any socket talking
    /// to the remote IP.
    pub fn attribute(&self, q: &AttributionQuery) -> Option<&str> {
        let protocol_matches = |s: &SocketEntry| {
            q.protocol == Protocol::Other || q.protocol == Protocol::Icmp || s.protocol == q.protocol
        };

        if let Some(port) = q.remote_port {
            if let Some(hit) = self.sockets.iter().find(|o| {
                !o.socket.listening
                    && same_ip(o.socket.remote.ip(), q.remote_ip)
                    && o.socket.remote.port() == port
                    && protocol_matches(&o.socket)
            }) {
                return Some(&hit.process);
            }
        }

        if q.direction == Direction::Inbound {
            if let Some(port) = q.local_port {
                if let Some(hit) = self.sockets.iter().find(|o| {
                    o.socket.local.port() == port
                        && (o.socket.listening || o.socket.remote.ip().is_unspecified())
                        && protocol_matches(&o.socket)
                }) {
                    return Some(&hit.process);
                }
            }
        }

        self.sockets
            .iter()
            .find(|o| !o.socket.listening && same_ip(o.socket.remote.ip(), q.remote_ip))
            .map(|o| o.process.as_str())
    }
}

/// Compares addresses, treating `::ffff:a.b.c.d` as `a.b.c.d`.
fn same_ip(a: IpAddr, b: IpAddr) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Decodes the kernel's hex `ADDR:PORT` form. Address words are in host
/// byte order, the port is big-endian.
pub fn parse_hex_endpoint(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;

    let ip = match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(addr.get(i * 8..i * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Parses one /proc/net/{tcp,udp}[6] table.
pub fn parse_socket_table(content: &str, protocol: Protocol) -> Vec<SocketEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            Some(SocketEntry {
                protocol,
                local: parse_hex_endpoint(fields[1])?,
                remote: parse_hex_endpoint(fields[2])?,
                listening: protocol == Protocol::Tcp && fields[3] == TCP_LISTEN,
                inode: fields[9].parse().ok()?,
            })
        })
        .collect()
}

/// Extracts the inode from a `socket:[12345]` fd link target.
fn socket_inode(target: &Path) -> Option<u64> {
    let s = target.to_str()?;
    s.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

/// Maps socket inodes to the name of the process holding them. Processes
/// whose fd directory is unreadable are skipped.
pub fn socket_owners(proc_root: &Path) -> HashMap<u64, String> {
    collect_proc_entries(proc_root)
        .par_iter()
        .flat_map_iter(|entry| {
            let inodes: Vec<u64> = fs::read_dir(entry.proc_path.join("fd"))
                .map(|fds| {
                    fds.flatten()
                        .filter_map(|fd| fs::read_link(fd.path()).ok())
                        .filter_map(|target| socket_inode(&target))
                        .collect()
                })
                .unwrap_or_default();
            let name = if inodes.is_empty() {
                None
            } else {
                read_process_name(&entry.proc_path)
            };
            inodes
                .into_iter()
                .filter_map(move |inode| name.clone().map(|n| (inode, n)))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .collect()
}

/// A source of connection table snapshots.
pub trait ConnectionSource: Send + Sync + 'static {
    fn snapshot(&self) -> std::io::Result<ConnectionTable>;
}

/// Reads the live table from procfs.
pub struct ProcConnectionSource {
    proc_root: PathBuf,
}

impl ProcConnectionSource {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl ConnectionSource for ProcConnectionSource {
    fn snapshot(&self) -> std::io::Result<ConnectionTable> {
        let mut sockets = Vec::new();
        let mut found_any = false;
        for (file, protocol) in [
            ("net/tcp", Protocol::Tcp),
            ("net/tcp6", Protocol::Tcp),
            ("net/udp", Protocol::Udp),
            ("net/udp6", Protocol::Udp),
        ] {
            match fs::read_to_string(self.proc_root.join(file)) {
                Ok(content) => {
                    found_any = true;
                    sockets.extend(parse_socket_table(&content, protocol));
                }
                Err(e) => debug!("Skipping {}: {}", file, e),
            }
        }
        if !found_any {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no /proc/net socket tables",
            ));
        }

        let owners = socket_owners(&self.proc_root);
        let owned = sockets
            .into_iter()
            .filter_map(|socket| {
                let process = owners.get(&socket.inode)?.clone();
                Some(OwnedSocket { socket, process })
            })
            .collect();
        Ok(ConnectionTable::new(owned))
    }
}
