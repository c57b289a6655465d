//! CPU utilisation sampler backed by /proc/stat.
//!
//! Busy percentages are computed from the delta between two consecutive
//! reads. The very first read reports the average since boot.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

use super::{read_source, Sampler};
use crate::error::SamplerError;

/// Cumulative CPU times for one `cpu*` line, in clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    /// Non-active time (idle + iowait).
    pub fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }

    /// Busy percent between `previous` and `self`. Returns `None` when no
    /// ticks elapsed.
    pub fn busy_percent_since(&self, previous: &CpuTimes) -> Option<f64> {
        let delta_total = self.total().saturating_sub(previous.total());
        if delta_total == 0 {
            return None;
        }
        let delta_idle = self.idle_total().saturating_sub(previous.idle_total());
        let busy = delta_total.saturating_sub(delta_idle);
        Some(busy as f64 / delta_total as f64 * 100.0)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CpuReading {
    pub per_core: Vec<f64>,
    pub total: f64,
}

/// Parses the `cpu` and `cpuN` lines of /proc/stat, preserving file order.
pub fn parse_cpu_stats(content: &str) -> Result<Vec<(String, CpuTimes)>, SamplerError> {
    let mut out = Vec::new();

    for line in content.lines() {
        if !line.starts_with("cpu") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 {
            return Err(SamplerError::Parse(format!(
                "short /proc/stat cpu line: {line}"
            )));
        }
        let field = |i: usize| -> u64 { parts.get(i).and_then(|v| v.parse().ok()).unwrap_or(0) };
        out.push((
            parts[0].to_string(),
            CpuTimes {
                user: field(1),
                nice: field(2),
                system: field(3),
                idle: field(4),
                iowait: field(5),
                irq: field(6),
                softirq: field(7),
                steal: field(8),
            },
        ));
    }

    if out.is_empty() {
        return Err(SamplerError::Parse("no cpu lines in /proc/stat".into()));
    }
    Ok(out)
}

pub struct CpuSampler {
    proc_root: PathBuf,
    previous: HashMap<String, CpuTimes>,
}

impl CpuSampler {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            previous: HashMap::new(),
        }
    }

    fn read(&mut self) -> Result<CpuReading, SamplerError> {
        let content = read_source(&self.proc_root.join("stat"))?;
        let current = parse_cpu_stats(&content)?;

        let mut total = None;
        let mut per_core = Vec::new();

        for (name, times) in &current {
            let previous = self.previous.get(name).copied().unwrap_or_default();
            let busy = times
                .busy_percent_since(&previous)
                .or_else(|| times.busy_percent_since(&CpuTimes::default()))
                .unwrap_or(0.0);
            if name == "cpu" {
                total = Some(busy);
            } else {
                per_core.push(busy);
            }
        }

        self.previous = current.into_iter().collect();

        let total = match total {
            Some(t) => t,
            None if !per_core.is_empty() => per_core.iter().sum::<f64>() / per_core.len() as f64,
            None => return Err(SamplerError::Parse("no aggregate cpu line".into())),
        };

        Ok(CpuReading { per_core, total })
    }
}

impl Sampler for CpuSampler {
    type Output = CpuReading;

    fn name(&self) -> &'static str {
        "cpu"
    }

    async fn sample(&mut self) -> Result<CpuReading, SamplerError> {
        self.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const STAT_A: &str = "cpu  100 0 100 800 0 0 0 0 0 0\n\
                          cpu0 50 0 50 400 0 0 0 0 0 0\n\
                          cpu1 50 0 50 400 0 0 0 0 0 0\n\
                          intr 12345\n";
    const STAT_B: &str = "cpu  200 0 200 1000 0 0 0 0 0 0\n\
                          cpu0 150 0 50 500 0 0 0 0 0 0\n\
                          cpu1 50 0 150 500 0 0 0 0 0 0\n\
                          intr 12399\n";

    #[test]
    fn test_busy_percent_since() {
        let prev = CpuTimes {
            user: 10,
            idle: 90,
            ..Default::default()
        };
        let cur = CpuTimes {
            user: 60,
            idle: 140,
            ..Default::default()
        };
        assert_eq!(cur.busy_percent_since(&prev), Some(50.0));
        assert_eq!(cur.busy_percent_since(&cur), None);
    }

    #[test]
    fn test_parse_cpu_stats_order_and_fields() {
        let parsed = parse_cpu_stats(STAT_A).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].0, "cpu");
        assert_eq!(parsed[1].0, "cpu0");
        assert_eq!(parsed[0].1.idle, 800);
    }

    #[test]
    fn test_parse_cpu_stats_rejects_empty() {
        assert!(parse_cpu_stats("intr 1\n").is_err());
    }

    #[tokio::test]
    async fn test_sampler_uses_deltas() {
        let dir = tempdir().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("stat"), STAT_A).unwrap();

        let mut sampler = CpuSampler::new(dir.path());
        let first = sampler.sample().await.unwrap();
        // Since boot: 200 busy of 1000
        assert!((first.total - 20.0).abs() < 1e-9);

        std::fs::write(dir.path().join("stat"), STAT_B).unwrap();
        let second = sampler.sample().await.unwrap();
        // Delta: 200 busy of 400
        assert!((second.total - 50.0).abs() < 1e-9);
        assert_eq!(second.per_core.len(), 2);
        assert!((second.per_core[0] - 50.0).abs() < 1e-9);
        assert!((second.per_core[1] - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_stat_is_unavailable() {
        let dir = tempdir().expect("Failed to create temp dir");
        let mut sampler = CpuSampler::new(dir.path());
        let err = sampler.sample().await.unwrap_err();
        assert!(err.is_permanent());
    }
}
