//! The per-second snapshot published to clients.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capture::CaptureState;
use crate::collectors::{
    BatteryReading, CpuReading, DiskReading, EnergyReading, LatencyReading, MemoryReading,
    NetworkReading, ProcessesReading, ThermalReading,
};
use crate::flow::FlowRecord;
use crate::sustainability::SustainabilityReading;

/// How trustworthy a family's value is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingStatus {
    /// Latest read succeeded.
    Ok,
    /// Latest read failed; the value is the last good one.
    Stale,
    /// Never sampled yet.
    Pending,
    /// Every read so far failed; no value.
    Failed,
    /// The source does not exist on this host.
    Unavailable,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Ok => "ok",
            ReadingStatus::Stale => "stale",
            ReadingStatus::Pending => "pending",
            ReadingStatus::Failed => "failed",
            ReadingStatus::Unavailable => "unavailable",
        }
    }
}

/// One metric family in the snapshot. Value fields are flattened next to
/// the status fields and are absent whenever `value` is `None`.
#[derive(Debug, Clone, Serialize)]
pub struct Reading<T> {
    pub status: ReadingStatus,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub value: Option<T>,
}

impl<T> Reading<T> {
    pub fn ok(value: T, at: DateTime<Utc>) -> Self {
        Self {
            status: ReadingStatus::Ok,
            error: None,
            updated_at: Some(at),
            value: Some(value),
        }
    }

    pub fn pending() -> Self {
        Self {
            status: ReadingStatus::Pending,
            error: None,
            updated_at: None,
            value: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReadingStatus::Ok
    }
}

/// Health of packet capture and the flow pipeline behind it.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CaptureStatus {
    pub capture_available: bool,
    pub capture_method: String,
    pub sniffer_running: bool,
    pub sniffer_state: CaptureState,
    pub sniffer_error: Option<String>,
    pub restarts: u64,
    pub line_count: u64,
    pub packet_count: u64,
    pub ignored_count: u64,
    pub local_match_count: u64,
    pub flow_keys: usize,
    pub geo_cached: usize,
    pub geo_inflight: usize,
    pub local_ip_count: usize,
    pub ifaces: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu: Reading<CpuReading>,
    pub memory: Reading<MemoryReading>,
    pub disk: Reading<DiskReading>,
    pub network: Reading<NetworkReading>,
    pub latency: Reading<LatencyReading>,
    pub thermal: Reading<ThermalReading>,
    pub energy: Reading<EnergyReading>,
    pub battery: Reading<BatteryReading>,
    pub sustainability: Reading<SustainabilityReading>,
    pub processes: Reading<ProcessesReading>,
    pub network_flows: Vec<FlowRecord>,
    pub capture_status: CaptureStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_flattens_value() {
        let r = Reading::ok(
            MemoryReading {
                used: 1,
                total: 2,
                available: 1,
                pressure: 50.0,
                swap_used: 0,
                swap_total: 0,
                swap_percent: 0.0,
            },
            Utc::now(),
        );
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["pressure"], 50.0);
        assert!(json["error"].is_null());
    }

    #[test]
    fn test_pending_has_no_value_fields() {
        let r: Reading<MemoryReading> = Reading::pending();
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("pressure").is_none());
    }
}
