//! Disk I/O sampler backed by /proc/diskstats.
//!
//! Only whole devices are summed; partitions, loop and ram devices are
//! skipped so traffic is not counted twice.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use super::{mb_per_sec, read_source, Sampler};
use crate::error::SamplerError;

const SECTOR_BYTES: u64 = 512;

/// Disk statistics for a single device.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiskStats {
    pub reads_completed: u64,
    pub sectors_read: u64,
    pub writes_completed: u64,
    pub sectors_written: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiskReading {
    pub read_bytes: u64,
    pub write_bytes: u64,
    /// Rates are null on the first reading.
    pub read_mb_s: Option<f64>,
    pub write_mb_s: Option<f64>,
    pub read_iops: Option<f64>,
    pub write_iops: Option<f64>,
}

/// Parses /proc/diskstats.
///
/// Format: major minor name read_ios read_merges read_sectors read_ticks
/// write_ios write_merges write_sectors write_ticks ...
pub fn parse_diskstats(content: &str) -> HashMap<String, DiskStats> {
    let mut stats = HashMap::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue;
        }

        let device = parts[2].to_string();
        if device.starts_with("loop") || device.starts_with("ram") {
            continue;
        }

        stats.insert(
            device,
            DiskStats {
                reads_completed: parts[3].parse().unwrap_or(0),
                sectors_read: parts[5].parse().unwrap_or(0),
                writes_completed: parts[7].parse().unwrap_or(0),
                sectors_written: parts[9].parse().unwrap_or(0),
            },
        );
    }

    stats
}

/// True if `name` is a partition of another device in `devices`
/// (sda1 of sda, nvme0n1p2 of nvme0n1, mmcblk0p1 of mmcblk0).
fn is_partition<'a>(name: &str, mut devices: impl Iterator<Item = &'a String>) -> bool {
    devices.any(|parent| {
        parent.as_str() != name
            && name.starts_with(parent.as_str())
            && {
                let rest = &name[parent.len()..];
                let digits = rest.strip_prefix('p').unwrap_or(rest);
                !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
            }
    })
}

/// Sums whole-device counters.
pub fn sum_whole_devices(stats: &HashMap<String, DiskStats>) -> DiskStats {
    let mut total = DiskStats::default();
    for (name, s) in stats {
        if is_partition(name, stats.keys()) {
            continue;
        }
        total.reads_completed += s.reads_completed;
        total.sectors_read += s.sectors_read;
        total.writes_completed += s.writes_completed;
        total.sectors_written += s.sectors_written;
    }
    total
}

pub struct DiskSampler {
    proc_root: PathBuf,
    previous: Option<(DiskStats, Instant)>,
}

impl DiskSampler {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            previous: None,
        }
    }
}

impl Sampler for DiskSampler {
    type Output = DiskReading;

    fn name(&self) -> &'static str {
        "disk"
    }

    async fn sample(&mut self) -> Result<DiskReading, SamplerError> {
        let content = read_source(&self.proc_root.join("diskstats"))?;
        let now = Instant::now();
        let current = sum_whole_devices(&parse_diskstats(&content));

        let mut reading = DiskReading {
            read_bytes: current.sectors_read * SECTOR_BYTES,
            write_bytes: current.sectors_written * SECTOR_BYTES,
            read_mb_s: None,
            write_mb_s: None,
            read_iops: None,
            write_iops: None,
        };

        if let Some((prev, at)) = self.previous {
            let elapsed = now.duration_since(at);
            let secs = elapsed.as_secs_f64().max(1e-6);
            let read_delta = current.sectors_read.saturating_sub(prev.sectors_read) * SECTOR_BYTES;
            let write_delta =
                current.sectors_written.saturating_sub(prev.sectors_written) * SECTOR_BYTES;
            reading.read_mb_s = Some(mb_per_sec(read_delta, elapsed));
            reading.write_mb_s = Some(mb_per_sec(write_delta, elapsed));
            reading.read_iops =
                Some(current.reads_completed.saturating_sub(prev.reads_completed) as f64 / secs);
            reading.write_iops =
                Some(current.writes_completed.saturating_sub(prev.writes_completed) as f64 / secs);
        }

        self.previous = Some((current, now));
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DISKSTATS: &str = "\
   8       0 sda 100 0 2000 0 50 0 1000 0 0 0 0
   8       1 sda1 90 0 1800 0 40 0 900 0 0 0 0
 259       0 nvme0n1 10 0 200 0 5 0 100 0 0 0 0
 259       1 nvme0n1p1 10 0 200 0 5 0 100 0 0 0 0
   7       0 loop0 999 0 9999 0 0 0 0 0 0 0 0
";

    #[test]
    fn test_parse_skips_loop_devices() {
        let stats = parse_diskstats(DISKSTATS);
        assert!(stats.contains_key("sda"));
        assert!(!stats.contains_key("loop0"));
    }

    #[test]
    fn test_sum_whole_devices_ignores_partitions() {
        let total = sum_whole_devices(&parse_diskstats(DISKSTATS));
        assert_eq!(total.sectors_read, 2200);
        assert_eq!(total.sectors_written, 1100);
        assert_eq!(total.reads_completed, 110);
    }

    #[tokio::test]
    async fn test_first_reading_has_no_rates() {
        let dir = tempdir().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("diskstats"), DISKSTATS).unwrap();

        let mut sampler = DiskSampler::new(dir.path());
        let first = sampler.sample().await.unwrap();
        assert_eq!(first.read_bytes, 2200 * 512);
        assert!(first.read_mb_s.is_none());

        let second = sampler.sample().await.unwrap();
        assert_eq!(second.read_mb_s, Some(0.0));
        assert_eq!(second.write_iops, Some(0.0));
    }
}
