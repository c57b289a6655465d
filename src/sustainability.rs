//! Running energy and CO2e estimate derived from the energy and network
//! readings at each publish tick.

use serde::Serialize;
use std::time::Instant;

const JOULES_PER_KWH: f64 = 3_600_000.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NetworkFootprint {
    pub bytes: u64,
    pub gb: f64,
    pub energy_kwh: f64,
    pub co2e_g: f64,
    pub kwh_per_gb: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SustainabilityReading {
    /// Device energy since start; null until a wattage reading exists.
    pub energy_kwh: Option<f64>,
    pub device_co2e_g: Option<f64>,
    pub co2e_g: f64,
    pub intensity_g_per_kwh: f64,
    pub network: NetworkFootprint,
}

pub struct SustainabilityTracker {
    kwh_per_gb: f64,
    intensity_g_per_kwh: f64,
    device_kwh: Option<f64>,
    network_bytes: u64,
    last_tick: Option<Instant>,
    last_net_total: Option<u64>,
}

impl SustainabilityTracker {
    pub fn new(kwh_per_gb: f64, intensity_g_per_kwh: f64) -> Self {
        Self {
            kwh_per_gb,
            intensity_g_per_kwh,
            device_kwh: None,
            network_bytes: 0,
            last_tick: None,
            last_net_total: None,
        }
    }

    /// Integrates one tick. `wattage` is the latest device draw, `net_total`
    /// the cumulative sent+received byte counter.
    pub fn update(
        &mut self,
        wattage: Option<f64>,
        net_total: Option<u64>,
        now: Instant,
    ) -> SustainabilityReading {
        let elapsed = self
            .last_tick
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        self.last_tick = Some(now);

        if let Some(watts) = wattage.filter(|w| w.is_finite() && *w >= 0.0) {
            *self.device_kwh.get_or_insert(0.0) += watts * elapsed / JOULES_PER_KWH;
        }

        if let Some(total) = net_total {
            if let Some(prev) = self.last_net_total {
                // Counter resets (interface removed) contribute nothing
                self.network_bytes += total.saturating_sub(prev);
            }
            self.last_net_total = Some(total);
        }

        self.reading()
    }

    pub fn reading(&self) -> SustainabilityReading {
        let gb = self.network_bytes as f64 / BYTES_PER_GB;
        let network_kwh = gb * self.kwh_per_gb;
        let network_co2 = network_kwh * self.intensity_g_per_kwh;
        let device_co2 = self.device_kwh.map(|kwh| kwh * self.intensity_g_per_kwh);

        SustainabilityReading {
            energy_kwh: self.device_kwh,
            device_co2e_g: device_co2,
            co2e_g: device_co2.unwrap_or(0.0) + network_co2,
            intensity_g_per_kwh: self.intensity_g_per_kwh,
            network: NetworkFootprint {
                bytes: self.network_bytes,
                gb,
                energy_kwh: network_kwh,
                co2e_g: network_co2,
                kwh_per_gb: self.kwh_per_gb,
            },
        }
    }
}
