//! Power draw sampler.
//!
//! Prefers RAPL package counters (`/sys/class/powercap/intel-rapl:N/energy_uj`),
//! which are cumulative microjoules and need two reads for a wattage. Falls
//! back to `power_now` (microwatts) reported by any power supply.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

use super::Sampler;
use crate::error::SamplerError;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnergyReading {
    /// Null until two RAPL reads exist.
    pub wattage: Option<f64>,
    pub source: String,
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Top-level RAPL package domains (`intel-rapl:0`, not `intel-rapl:0:0`).
fn rapl_domains(sys_root: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = fs::read_dir(sys_root.join("class/powercap"))
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .and_then(|n| n.strip_prefix("intel-rapl:"))
                        .is_some_and(|idx| !idx.contains(':'))
                })
                .filter(|p| p.join("energy_uj").exists())
                .collect()
        })
        .unwrap_or_default();
    out.sort();
    out
}

/// Sum of `power_now` across supplies, in watts.
fn power_supply_watts(sys_root: &Path) -> Option<f64> {
    let entries = fs::read_dir(sys_root.join("class/power_supply")).ok()?;
    let mut total = None;
    for entry in entries.flatten() {
        if let Some(uw) = read_u64(&entry.path().join("power_now")) {
            *total.get_or_insert(0.0) += uw as f64 / 1_000_000.0;
        }
    }
    total
}

struct RaplSample {
    energy_uj: Vec<(u64, u64)>,
    at: Instant,
}

pub struct EnergySampler {
    sys_root: PathBuf,
    previous: Option<RaplSample>,
}

impl EnergySampler {
    pub fn new(sys_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            previous: None,
        }
    }

    fn read_rapl(&mut self, domains: &[PathBuf]) -> Option<f64> {
        let now = Instant::now();
        let current: Vec<(u64, u64)> = domains
            .iter()
            .map(|d| {
                (
                    read_u64(&d.join("energy_uj")).unwrap_or(0),
                    read_u64(&d.join("max_energy_range_uj")).unwrap_or(u64::MAX),
                )
            })
            .collect();

        let wattage = self.previous.as_ref().and_then(|prev| {
            if prev.energy_uj.len() != current.len() {
                return None;
            }
            let secs = now.duration_since(prev.at).as_secs_f64();
            if secs <= 0.0 {
                return None;
            }
            let joules: f64 = current
                .iter()
                .zip(&prev.energy_uj)
                .map(|(&(cur, range), &(old, _))| {
                    // Counter wraps at max_energy_range_uj
                    let delta = if cur >= old {
                        cur - old
                    } else {
                        range.saturating_sub(old) + cur
                    };
                    delta as f64 / 1_000_000.0
                })
                .sum();
            Some(joules / secs)
        });

        self.previous = Some(RaplSample {
            energy_uj: current,
            at: now,
        });
        wattage
    }
}

impl Sampler for EnergySampler {
    type Output = EnergyReading;

    fn name(&self) -> &'static str {
        "energy"
    }

    async fn sample(&mut self) -> Result<EnergyReading, SamplerError> {
        let domains = rapl_domains(&self.sys_root);
        if !domains.is_empty() {
            let wattage = self.read_rapl(&domains);
            debug!("RAPL wattage: {:?}", wattage);
            return Ok(EnergyReading {
                wattage,
                source: "rapl".into(),
            });
        }

        match power_supply_watts(&self.sys_root) {
            Some(watts) => Ok(EnergyReading {
                wattage: Some(watts),
                source: "power_supply".into(),
            }),
            None => Err(SamplerError::Unavailable(
                "no RAPL domain or power_now source".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rapl_needs_two_reads() {
        let dir = tempdir().expect("Failed to create temp dir");
        let pkg = dir.path().join("class/powercap/intel-rapl:0");
        let sub = dir.path().join("class/powercap/intel-rapl:0:0");
        fs::create_dir_all(&pkg).unwrap();
        fs::create_dir_all(&sub).unwrap();
        fs::write(pkg.join("energy_uj"), "1000000\n").unwrap();
        fs::write(sub.join("energy_uj"), "999999999\n").unwrap();

        let mut sampler = EnergySampler::new(dir.path());
        let first = sampler.sample().await.unwrap();
        assert_eq!(first.source, "rapl");
        assert!(first.wattage.is_none());

        fs::write(pkg.join("energy_uj"), "3000000\n").unwrap();
        let second = sampler.sample().await.unwrap();
        let watts = second.wattage.unwrap();
        assert!(watts > 0.0);
    }

    #[tokio::test]
    async fn test_power_supply_fallback() {
        let dir = tempdir().expect("Failed to create temp dir");
        let bat = dir.path().join("class/power_supply/BAT0");
        fs::create_dir_all(&bat).unwrap();
        fs::write(bat.join("power_now"), "12500000\n").unwrap();

        let reading = EnergySampler::new(dir.path()).sample().await.unwrap();
        assert_eq!(reading.source, "power_supply");
        assert_eq!(reading.wattage, Some(12.5));
    }

    #[tokio::test]
    async fn test_no_source_is_unavailable() {
        let dir = tempdir().expect("Failed to create temp dir");
        let err = EnergySampler::new(dir.path()).sample().await.unwrap_err();
        assert!(err.is_permanent());
    }
}
