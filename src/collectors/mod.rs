//! Samplers for the per-family host metrics.
//!
//! Every sampler wraps one data source (a /proc or /sys file, or an external
//! command) and exposes a single "read once" operation. Samplers own their
//! previous counters so rate computation never needs shared state; the
//! scheduler only ever sees finished readings.

use serde::Serialize;
use std::future::Future;
use std::time::Duration;

use crate::error::SamplerError;

pub mod battery;
pub mod cpu;
pub mod diskstats;
pub mod energy;
pub mod latency;
pub mod memory;
pub mod netdev;
pub mod processes;
pub mod thermal;

pub use battery::{BatteryReading, BatterySampler};
pub use cpu::{CpuReading, CpuSampler};
pub use diskstats::{DiskReading, DiskSampler};
pub use energy::{EnergyReading, EnergySampler};
pub use latency::{LatencyReading, LatencySampler};
pub use memory::{MemoryReading, MemorySampler};
pub use netdev::{NetworkReading, NetworkSampler};
pub use processes::{ProcessInfo, ProcessesReading, ProcessesSampler};
pub use thermal::{ThermalReading, ThermalSampler};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// A single metric family source.
pub trait Sampler: Send + 'static {
    type Output: Clone + Serialize + Send + Sync + 'static;

    /// Stable family name used in logs and self-telemetry labels.
    fn name(&self) -> &'static str;

    /// Reads the source once.
    fn sample(&mut self) -> impl Future<Output = Result<Self::Output, SamplerError>> + Send;
}

/// Converts a byte delta over `elapsed` into MiB/s.
pub fn mb_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(1e-6);
    bytes as f64 / secs / BYTES_PER_MB
}

/// Reads a file and maps a missing file to `SamplerError::Unavailable`.
pub(crate) fn read_source(path: &std::path::Path) -> Result<String, SamplerError> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            SamplerError::Unavailable(format!("{} not present", path.display()))
        }
        _ => SamplerError::Io(e),
    })
}
