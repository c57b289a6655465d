//! Per-interval byte accumulation keyed by `(direction, remote_ip)`.

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};

use super::record::{FlowKey, Protocol};

/// Accumulated traffic for one key in the current interval.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowEntry {
    pub bytes: u64,
    /// Port and protocol of the most recent packet.
    pub remote_port: Option<u16>,
    pub local_port: Option<u16>,
    pub protocol: Protocol,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct FlowTable {
    entries: HashMap<FlowKey, FlowEntry>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        key: FlowKey,
        bytes: u64,
        remote_port: Option<u16>,
        local_port: Option<u16>,
        protocol: Protocol,
        seen: DateTime<Utc>,
    ) {
        let entry = self.entries.entry(key).or_insert(FlowEntry {
            bytes: 0,
            remote_port,
            local_port,
            protocol,
            last_seen: seen,
        });
        entry.bytes = entry.bytes.saturating_add(bytes);
        entry.remote_port = remote_port.or(entry.remote_port);
        entry.local_port = local_port.or(entry.local_port);
        if protocol != Protocol::Other {
            entry.protocol = protocol;
        }
        entry.last_seen = seen;
    }

    /// Takes every entry and leaves the table empty.
    pub fn drain(&mut self) -> HashMap<FlowKey, FlowEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
