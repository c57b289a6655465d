//! Memory sampler backed by /proc/meminfo.

use serde::Serialize;
use std::path::PathBuf;

use super::{read_source, Sampler};
use crate::error::SamplerError;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemoryReading {
    pub used: u64,
    pub total: u64,
    pub available: u64,
    /// Used share of total memory in percent.
    pub pressure: f64,
    pub swap_used: u64,
    pub swap_total: u64,
    pub swap_percent: f64,
}

/// Parses the fields we need from /proc/meminfo (values are in kB).
pub fn parse_meminfo(content: &str) -> Result<MemoryReading, SamplerError> {
    let mut total = None;
    let mut available = None;
    let mut free = None;
    let mut cached = None;
    let mut buffers = None;
    let mut swap_total = None;
    let mut swap_free = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        let bytes = Some(kb * 1024);
        match key {
            "MemTotal:" => total = bytes,
            "MemAvailable:" => available = bytes,
            "MemFree:" => free = bytes,
            "Cached:" => cached = bytes,
            "Buffers:" => buffers = bytes,
            "SwapTotal:" => swap_total = bytes,
            "SwapFree:" => swap_free = bytes,
            _ => {}
        }
    }

    let total = total.ok_or_else(|| SamplerError::Parse("MemTotal missing".into()))?;
    // Kernels before 3.14 have no MemAvailable
    let available = match available {
        Some(a) => a,
        None => free.unwrap_or(0) + cached.unwrap_or(0) + buffers.unwrap_or(0),
    };
    let used = total.saturating_sub(available);
    let swap_total = swap_total.unwrap_or(0);
    let swap_used = swap_total.saturating_sub(swap_free.unwrap_or(swap_total));

    let pressure = if total > 0 {
        used as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    let swap_percent = if swap_total > 0 {
        swap_used as f64 / swap_total as f64 * 100.0
    } else {
        0.0
    };

    Ok(MemoryReading {
        used,
        total,
        available,
        pressure,
        swap_used,
        swap_total,
        swap_percent,
    })
}

pub struct MemorySampler {
    proc_root: PathBuf,
}

impl MemorySampler {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Sampler for MemorySampler {
    type Output = MemoryReading;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn sample(&mut self) -> Result<MemoryReading, SamplerError> {
        let content = read_source(&self.proc_root.join("meminfo"))?;
        parse_meminfo(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:        1000 kB\n\
                           MemFree:          100 kB\n\
                           MemAvailable:     250 kB\n\
                           Buffers:           10 kB\n\
                           Cached:            90 kB\n\
                           SwapTotal:        400 kB\n\
                           SwapFree:         300 kB\n";

    #[test]
    fn test_parse_meminfo() {
        let m = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(m.total, 1000 * 1024);
        assert_eq!(m.available, 250 * 1024);
        assert_eq!(m.used, 750 * 1024);
        assert!((m.pressure - 75.0).abs() < 1e-9);
        assert_eq!(m.swap_used, 100 * 1024);
        assert!((m.swap_percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_meminfo_without_memavailable() {
        let content = "MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 10 kB\nCached: 90 kB\n";
        let m = parse_meminfo(content).unwrap();
        assert_eq!(m.available, 200 * 1024);
        assert_eq!(m.swap_total, 0);
        assert_eq!(m.swap_percent, 0.0);
    }

    #[test]
    fn test_parse_meminfo_requires_total() {
        assert!(parse_meminfo("MemFree: 1 kB\n").is_err());
    }
}
