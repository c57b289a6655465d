//! Battery health sampler backed by /sys/class/power_supply/BAT*.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use super::Sampler;
use crate::error::SamplerError;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatteryReading {
    pub name: String,
    /// Full capacity as a share of design capacity.
    pub health_percent: f64,
    pub full_capacity: u64,
    pub design_capacity: u64,
    /// excellent, good, fair or poor.
    pub health_label: &'static str,
    pub charge_percent: Option<f64>,
    pub charging: Option<String>,
}

pub fn health_label(health_percent: f64) -> &'static str {
    if health_percent >= 90.0 {
        "excellent"
    } else if health_percent >= 80.0 {
        "good"
    } else if health_percent >= 70.0 {
        "fair"
    } else {
        "poor"
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_u64(path: &Path) -> Option<u64> {
    read_trimmed(path)?.parse().ok()
}

/// Reads one battery directory. Drivers report either `energy_*` (µWh) or
/// `charge_*` (µAh).
pub fn read_battery(dir: &Path) -> Option<BatteryReading> {
    let (full, design) = ["energy", "charge"].iter().find_map(|prefix| {
        let full = read_u64(&dir.join(format!("{prefix}_full")))?;
        let design = read_u64(&dir.join(format!("{prefix}_full_design")))?;
        Some((full, design))
    })?;
    if design == 0 {
        return None;
    }

    let health_percent = (full as f64 / design as f64 * 100.0).min(100.0);
    Some(BatteryReading {
        name: dir.file_name()?.to_string_lossy().to_string(),
        health_percent,
        full_capacity: full,
        design_capacity: design,
        health_label: health_label(health_percent),
        charge_percent: read_u64(&dir.join("capacity")).map(|c| c as f64),
        charging: read_trimmed(&dir.join("status")),
    })
}

pub struct BatterySampler {
    sys_root: PathBuf,
}

impl BatterySampler {
    pub fn new(sys_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
        }
    }
}

impl Sampler for BatterySampler {
    type Output = BatteryReading;

    fn name(&self) -> &'static str {
        "battery"
    }

    async fn sample(&mut self) -> Result<BatteryReading, SamplerError> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(self.sys_root.join("class/power_supply"))
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.starts_with("BAT"))
                    })
                    .collect()
            })
            .unwrap_or_default();
        dirs.sort();

        dirs.iter()
            .find_map(|d| read_battery(d))
            .ok_or_else(|| SamplerError::Unavailable("no battery present".into()))
    }
}
