//! Thermal sensor sampler.
//!
//! Reads temperatures from:
//! - /sys/class/thermal/thermal_zone*/temp (labelled by the zone's `type`)
//! - /sys/class/hwmon/hwmon*/temp*_input (labelled by the device `name`)
//!
//! CPU-class sensors are preferred; otherwise the hottest sensor wins.

use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::Sampler;
use crate::error::SamplerError;

const CPU_SENSOR_HINTS: &[&str] = &["coretemp", "k10temp", "zenpower", "x86_pkg_temp", "cpu"];

/// Coarse thermal pressure level derived from temperature.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThermalPressure {
    Nominal,
    Moderate,
    Heavy,
    Serious,
    Critical,
}

impl ThermalPressure {
    pub fn from_celsius(celsius: f64) -> Self {
        match celsius {
            t if t < 60.0 => ThermalPressure::Nominal,
            t if t < 75.0 => ThermalPressure::Moderate,
            t if t < 85.0 => ThermalPressure::Heavy,
            t if t < 95.0 => ThermalPressure::Serious,
            _ => ThermalPressure::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThermalReading {
    pub sensor: String,
    pub temperature_c: f64,
    pub pressure: ThermalPressure,
}

fn read_millidegrees(path: &Path) -> Option<f64> {
    let content = fs::read_to_string(path).ok()?;
    let milli: i64 = content.trim().parse().ok()?;
    Some(milli as f64 / 1000.0)
}

/// Reads temperature from all thermal zones, keyed by zone type.
pub fn read_thermal_zones(sys_root: &Path) -> HashMap<String, f64> {
    let mut temperatures = HashMap::new();
    let Ok(entries) = fs::read_dir(sys_root.join("class/thermal")) else {
        return temperatures;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let zone_name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => continue,
        };
        if !zone_name.starts_with("thermal_zone") {
            continue;
        }

        let Some(celsius) = read_millidegrees(&path.join("temp")) else {
            continue;
        };
        let label = fs::read_to_string(path.join("type"))
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or(zone_name);
        temperatures.insert(label, celsius);
    }

    temperatures
}

/// Reads temperature from hardware monitoring devices.
pub fn read_hwmon_temps(sys_root: &Path) -> HashMap<String, f64> {
    let mut temperatures = HashMap::new();
    let Ok(entries) = fs::read_dir(sys_root.join("class/hwmon")) else {
        return temperatures;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let hwmon_name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => continue,
        };
        if !hwmon_name.starts_with("hwmon") {
            continue;
        }

        let device_name = fs::read_to_string(path.join("name"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| hwmon_name.clone());

        let Ok(dir_entries) = fs::read_dir(&path) else {
            continue;
        };
        for temp_entry in dir_entries.flatten() {
            let temp_path = temp_entry.path();
            let temp_filename = match temp_path.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => continue,
            };
            if !temp_filename.starts_with("temp") || !temp_filename.ends_with("_input") {
                continue;
            }
            if let Some(celsius) = read_millidegrees(&temp_path) {
                temperatures.insert(format!("{}_{}", device_name, temp_filename), celsius);
            }
        }
    }

    temperatures
}

fn hottest<'a>(iter: impl Iterator<Item = (&'a String, &'a f64)>) -> Option<(String, f64)> {
    iter.max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(k, v)| (k.clone(), *v))
}

/// Picks the representative sensor: hottest CPU-class sensor, else hottest overall.
pub fn pick_sensor(temps: &HashMap<String, f64>) -> Option<(String, f64)> {
    let cpu = temps.iter().filter(|(name, _)| {
        let lower = name.to_lowercase();
        CPU_SENSOR_HINTS.iter().any(|hint| lower.contains(hint))
    });
    hottest(cpu).or_else(|| hottest(temps.iter()))
}

pub struct ThermalSampler {
    sys_root: PathBuf,
}

impl ThermalSampler {
    pub fn new(sys_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
        }
    }
}

impl Sampler for ThermalSampler {
    type Output = ThermalReading;

    fn name(&self) -> &'static str {
        "thermal"
    }

    async fn sample(&mut self) -> Result<ThermalReading, SamplerError> {
        let mut temps = read_thermal_zones(&self.sys_root);
        temps.extend(read_hwmon_temps(&self.sys_root));

        let (sensor, temperature_c) = pick_sensor(&temps)
            .ok_or_else(|| SamplerError::Unavailable("no thermal sensors found".into()))?;

        Ok(ThermalReading {
            sensor,
            temperature_c,
            pressure: ThermalPressure::from_celsius(temperature_c),
        })
    }
}
