//! Prometheus self-telemetry for the capture, flow, geolocation and
//! sampling pipeline.
//!
//! Gauges mirror counters owned by the pipeline components; they are
//! refreshed from those counters on every publish tick rather than
//! incremented in hot paths.

use prometheus::{Gauge, GaugeVec, Opts, Registry};

use crate::flow::AggregatorStats;
use crate::geo::GeoStats;
use crate::scheduler::SamplerHealth;
use crate::snapshot::{CaptureStatus, ReadingStatus};

#[derive(Clone)]
pub struct PipelineMetrics {
    // ========== Capture ==========
    pub capture_running: Gauge,
    pub capture_restarts: Gauge,
    pub capture_lines: Gauge,

    // ========== Flows ==========
    pub flow_packets: Gauge,
    pub flow_ignored: Gauge,
    pub flow_local_match: Gauge,
    pub flow_keys: Gauge,
    pub flow_records_emitted: Gauge,

    // ========== Geolocation ==========
    pub geo_cache_entries: Gauge,
    pub geo_negative_entries: Gauge,
    pub geo_inflight: Gauge,
    pub geo_lookups: GaugeVec, // labels: outcome

    // ========== Samplers ==========
    pub sampler_available: GaugeVec,            // labels: sampler
    pub sampler_consecutive_failures: GaugeVec, // labels: sampler
    pub sampler_cadence_seconds: GaugeVec,      // labels: sampler

    // ========== Stream ==========
    pub stream_clients: Gauge,
    pub snapshot_assembly_seconds: Gauge,
}

impl PipelineMetrics {
    /// Creates and registers all metrics with the registry.
    pub fn new(registry: &Registry) -> Result<Self, Box<dyn std::error::Error>> {
        let capture_running = Gauge::new(
            "hostpulse_capture_running",
            "1 if the capture process is running",
        )?;
        let capture_restarts = Gauge::new(
            "hostpulse_capture_restarts",
            "Capture process restarts since start",
        )?;
        let capture_lines = Gauge::new(
            "hostpulse_capture_lines",
            "Lines read from the capture process",
        )?;

        let flow_packets = Gauge::new("hostpulse_flow_packets", "Capture lines parsed as packets")?;
        let flow_ignored = Gauge::new(
            "hostpulse_flow_ignored",
            "Capture lines ignored (unparsable or not local-to-public)",
        )?;
        let flow_local_match = Gauge::new(
            "hostpulse_flow_local_match",
            "Packets with exactly one local and one public endpoint",
        )?;
        let flow_keys = Gauge::new("hostpulse_flow_keys", "Flow keys in the last flush")?;
        let flow_records_emitted = Gauge::new(
            "hostpulse_flow_records_emitted",
            "Flow records emitted across all flushes",
        )?;

        let geo_cache_entries = Gauge::new(
            "hostpulse_geo_cache_entries",
            "Resolved addresses in the geolocation cache",
        )?;
        let geo_negative_entries = Gauge::new(
            "hostpulse_geo_negative_entries",
            "Addresses in geolocation failure cooldown",
        )?;
        let geo_inflight = Gauge::new("hostpulse_geo_inflight", "Geolocation lookups in flight")?;
        let geo_lookups = GaugeVec::new(
            Opts::new("hostpulse_geo_lookups", "Geolocation lookups by outcome"),
            &["outcome"],
        )?;

        let sampler_available = GaugeVec::new(
            Opts::new(
                "hostpulse_sampler_available",
                "1 if the sampler's source exists on this host",
            ),
            &["sampler"],
        )?;
        let sampler_consecutive_failures = GaugeVec::new(
            Opts::new(
                "hostpulse_sampler_consecutive_failures",
                "Consecutive failed reads per sampler",
            ),
            &["sampler"],
        )?;

        let sampler_cadence_seconds = GaugeVec::new(
            Opts::new(
                "hostpulse_sampler_cadence_seconds",
                "Current read period per sampler, including unavailable back-off",
            ),
            &["sampler"],
        )?;

        let stream_clients = Gauge::new(
            "hostpulse_stream_clients",
            "Connected snapshot stream clients",
        )?;
        let snapshot_assembly_seconds = Gauge::new(
            "hostpulse_snapshot_assembly_seconds",
            "Time spent assembling the last snapshot",
        )?;

        registry.register(Box::new(capture_running.clone()))?;
        registry.register(Box::new(capture_restarts.clone()))?;
        registry.register(Box::new(capture_lines.clone()))?;

        registry.register(Box::new(flow_packets.clone()))?;
        registry.register(Box::new(flow_ignored.clone()))?;
        registry.register(Box::new(flow_local_match.clone()))?;
        registry.register(Box::new(flow_keys.clone()))?;
        registry.register(Box::new(flow_records_emitted.clone()))?;

        registry.register(Box::new(geo_cache_entries.clone()))?;
        registry.register(Box::new(geo_negative_entries.clone()))?;
        registry.register(Box::new(geo_inflight.clone()))?;
        registry.register(Box::new(geo_lookups.clone()))?;

        registry.register(Box::new(sampler_available.clone()))?;
        registry.register(Box::new(sampler_consecutive_failures.clone()))?;
        registry.register(Box::new(sampler_cadence_seconds.clone()))?;

        registry.register(Box::new(stream_clients.clone()))?;
        registry.register(Box::new(snapshot_assembly_seconds.clone()))?;

        Ok(Self {
            capture_running,
            capture_restarts,
            capture_lines,
            flow_packets,
            flow_ignored,
            flow_local_match,
            flow_keys,
            flow_records_emitted,
            geo_cache_entries,
            geo_negative_entries,
            geo_inflight,
            geo_lookups,
            sampler_available,
            sampler_consecutive_failures,
            sampler_cadence_seconds,
            stream_clients,
            snapshot_assembly_seconds,
        })
    }

    pub fn update_capture(&self, status: &CaptureStatus) {
        self.capture_running
            .set(if status.sniffer_running { 1.0 } else { 0.0 });
        self.capture_restarts.set(status.restarts as f64);
        self.capture_lines.set(status.line_count as f64);
    }

    pub fn update_flows(&self, stats: &AggregatorStats) {
        self.flow_packets.set(stats.packets as f64);
        self.flow_ignored.set(stats.ignored as f64);
        self.flow_local_match.set(stats.local_match as f64);
        self.flow_keys.set(stats.flow_keys as f64);
        self.flow_records_emitted.set(stats.emitted as f64);
    }

    pub fn update_geo(&self, stats: &GeoStats) {
        self.geo_cache_entries.set(stats.cached as f64);
        self.geo_negative_entries.set(stats.negative as f64);
        self.geo_inflight.set(stats.inflight as f64);
        self.geo_lookups
            .with_label_values(&["success"])
            .set(stats.successes as f64);
        self.geo_lookups
            .with_label_values(&["failure"])
            .set(stats.failures as f64);
    }

    pub fn update_samplers(&self, health: &[SamplerHealth]) {
        for h in health {
            let available = !matches!(h.status, ReadingStatus::Unavailable);
            self.sampler_available
                .with_label_values(&[h.name])
                .set(if available { 1.0 } else { 0.0 });
            self.sampler_consecutive_failures
                .with_label_values(&[h.name])
                .set(h.consecutive_failures as f64);
            self.sampler_cadence_seconds
                .with_label_values(&[h.name])
                .set(h.cadence_secs);
        }
    }
}
