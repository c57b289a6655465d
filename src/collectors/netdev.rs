//! Network interface throughput sampler backed by /proc/net/dev.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use super::{mb_per_sec, read_source, Sampler};
use crate::error::SamplerError;

/// Network interface statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetDevStats {
    pub receive_bytes: u64,
    pub transmit_bytes: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NetworkReading {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    /// Rates are null on the first reading.
    pub upload_mb_s: Option<f64>,
    pub download_mb_s: Option<f64>,
}

/// Parses /proc/net/dev into per-interface counters.
pub fn parse_netdev(content: &str) -> HashMap<String, NetDevStats> {
    let mut stats = HashMap::new();

    // Skip the two header lines
    for line in content.lines().skip(2) {
        let Some((interface, rest)) = line.split_once(':') else {
            continue;
        };

        let values: Vec<&str> = rest.split_whitespace().collect();
        if values.len() < 16 {
            continue;
        }

        stats.insert(
            interface.trim().to_string(),
            NetDevStats {
                receive_bytes: values[0].parse().unwrap_or(0),
                transmit_bytes: values[8].parse().unwrap_or(0),
            },
        );
    }

    stats
}

pub struct NetworkSampler {
    proc_root: PathBuf,
    previous: Option<(NetDevStats, Instant)>,
}

impl NetworkSampler {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            previous: None,
        }
    }
}

impl Sampler for NetworkSampler {
    type Output = NetworkReading;

    fn name(&self) -> &'static str {
        "network"
    }

    async fn sample(&mut self) -> Result<NetworkReading, SamplerError> {
        let content = read_source(&self.proc_root.join("net/dev"))?;
        let now = Instant::now();

        let total = parse_netdev(&content)
            .into_iter()
            .filter(|(name, _)| name != "lo")
            .fold(NetDevStats::default(), |acc, (_, s)| NetDevStats {
                receive_bytes: acc.receive_bytes + s.receive_bytes,
                transmit_bytes: acc.transmit_bytes + s.transmit_bytes,
            });

        let mut reading = NetworkReading {
            bytes_sent: total.transmit_bytes,
            bytes_recv: total.receive_bytes,
            upload_mb_s: None,
            download_mb_s: None,
        };

        if let Some((prev, at)) = self.previous {
            let elapsed = now.duration_since(at);
            reading.upload_mb_s = Some(mb_per_sec(
                total.transmit_bytes.saturating_sub(prev.transmit_bytes),
                elapsed,
            ));
            reading.download_mb_s = Some(mb_per_sec(
                total.receive_bytes.saturating_sub(prev.receive_bytes),
                elapsed,
            ));
        }

        self.previous = Some((total, now));
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 5000 10 0 0 0 0 0 0 5000 10 0 0 0 0 0 0
  eth0: 1000 10 0 0 0 0 0 0 2000 20 0 0 0 0 0 0
 wlan0: 300 3 0 0 0 0 0 0 400 4 0 0 0 0 0 0
";

    #[test]
    fn test_parse_netdev() {
        let stats = parse_netdev(NET_DEV);
        assert_eq!(stats.len(), 3);
        assert_eq!(stats["eth0"].receive_bytes, 1000);
        assert_eq!(stats["eth0"].transmit_bytes, 2000);
    }

    #[tokio::test]
    async fn test_sampler_excludes_loopback() {
        let dir = tempdir().expect("Failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("net/dev"), NET_DEV).unwrap();

        let mut sampler = NetworkSampler::new(dir.path());
        let reading = sampler.sample().await.unwrap();
        assert_eq!(reading.bytes_recv, 1300);
        assert_eq!(reading.bytes_sent, 2400);
        assert!(reading.upload_mb_s.is_none());

        let again = sampler.sample().await.unwrap();
        assert_eq!(again.upload_mb_s, Some(0.0));
    }
}
