//! Wires samplers, capture, attribution, geolocation and publishing into
//! one running pipeline.

use chrono::Utc;
use prometheus::Registry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::supervisor::{disabled, spawn as spawn_capture};
use crate::capture::{resolve_interface, CaptureCommand, CaptureHandle};
use crate::config::{Config, DEFAULT_CAPTURE_METHOD};
use crate::error::CaptureError;
use crate::flow::{FlowAggregator, LocalAddrs};
use crate::geo::{GeoResolver, HttpGeoLookup};
use crate::health_stats::HealthStats;
use crate::metrics::PipelineMetrics;
use crate::process::{ProcConnectionSource, ProcessAttributor};
use crate::publisher::Publisher;
use crate::scheduler::{run_publish_loop, SamplerSet, SamplerTable};
use crate::snapshot::{CaptureStatus, MetricSnapshot, Reading};
use crate::sustainability::SustainabilityTracker;

pub const PUBLISH_PERIOD: Duration = Duration::from_secs(1);
pub const FLUSH_PERIOD: Duration = Duration::from_secs(1);

/// Snapshots a slow stream client may fall behind by before skipping.
const STREAM_BACKLOG: usize = 8;

/// Shared handles to every running component. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<Config>,
    pub table: SamplerTable,
    pub publisher: Publisher,
    pub aggregator: FlowAggregator,
    pub attributor: ProcessAttributor,
    pub geo: GeoResolver,
    pub capture: CaptureHandle,
    pub capture_available: bool,
    pub capture_method: String,
    pub ifaces: Vec<String>,
    pub health_stats: Arc<HealthStats>,
    pub metrics: Option<PipelineMetrics>,
}

/// Join handles of the pipeline's background tasks.
pub struct PipelineTasks {
    handles: Vec<JoinHandle<()>>,
}

impl PipelineTasks {
    /// Waits for every task to finish; call after cancelling.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Pipeline task ended abnormally: {}", e);
            }
        }
    }
}

/// Host paths the pipeline reads from.
#[derive(Debug, Clone)]
pub struct HostRoots {
    pub proc_root: PathBuf,
    pub sys_root: PathBuf,
}

impl Default for HostRoots {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            sys_root: PathBuf::from("/sys"),
        }
    }
}

/// Brings up capture for the configured method, or a disabled handle with
/// the reason when capture cannot run here.
fn start_capture(
    config: &Config,
    roots: &HostRoots,
    cancel: &CancellationToken,
) -> (CaptureHandle, crate::capture::CaptureLines, bool, Vec<String>) {
    if !config.capture_enabled() {
        info!("Packet capture disabled by configuration");
        let (handle, lines) = disabled(&CaptureError::Disabled);
        return (handle, lines, false, Vec::new());
    }

    let configured = config.capture_interfaces.clone().unwrap_or_default();
    let iface = match resolve_interface(&configured, &roots.proc_root, &roots.sys_root) {
        Ok(iface) => iface,
        Err(e) => {
            warn!("Packet capture unavailable: {}", e);
            let (handle, lines) = disabled(&e);
            return (handle, lines, false, Vec::new());
        }
    };

    let binary = config.capture_binary.as_deref().unwrap_or("tcpdump");
    if which::which(binary).is_err() {
        let err = CaptureError::BinaryNotFound(binary.to_string());
        warn!("Packet capture unavailable: {}", err);
        let (handle, lines) = disabled(&err);
        return (handle, lines, false, vec![iface]);
    }

    let command = CaptureCommand::tcpdump(binary, &iface);
    info!("Starting packet capture: {}", command);
    let (handle, lines) = spawn_capture(command, config.supervisor_settings(), cancel.clone());
    (handle, lines, true, vec![iface])
}

impl Pipeline {
    /// Starts every background task against the real host.
    pub async fn start(
        config: Arc<Config>,
        registry: Option<&Registry>,
        cancel: CancellationToken,
    ) -> anyhow::Result<(Self, PipelineTasks)> {
        Self::start_with_roots(config, registry, HostRoots::default(), cancel).await
    }

    pub async fn start_with_roots(
        config: Arc<Config>,
        registry: Option<&Registry>,
        roots: HostRoots,
        cancel: CancellationToken,
    ) -> anyhow::Result<(Self, PipelineTasks)> {
        let mut handles = Vec::new();

        let metrics = match registry {
            Some(r) => Some(
                PipelineMetrics::new(r)
                    .map_err(|e| anyhow::anyhow!("failed to register metrics: {e}"))?,
            ),
            None => None,
        };

        // Attribution first so the aggregator sees local addresses from the start.
        let local = LocalAddrs::new();
        let attributor = ProcessAttributor::new(local.clone());
        let source = Arc::new(ProcConnectionSource::new(&roots.proc_root));
        attributor.refresh_once(&source, true).await;
        info!(
            "Discovered {} local addresses, {} sockets",
            local.len(),
            attributor.socket_count()
        );
        handles.push(tokio::spawn(attributor.clone().run_refresh_loop(
            source,
            config.attribution_refresh(),
            true,
            cancel.clone(),
        )));

        let geo_settings = config.geo_settings();
        let geo = GeoResolver::start(HttpGeoLookup::new(&geo_settings)?, &geo_settings, cancel.clone());

        let aggregator = FlowAggregator::new(
            local,
            attributor.clone(),
            geo.clone(),
            config.max_flow_items.unwrap_or(24).max(1),
        );

        let (capture, lines, capture_available, ifaces) = start_capture(&config, &roots, &cancel);
        handles.push(tokio::spawn(aggregator.clone().run_ingest(lines, cancel.clone())));

        let health_stats = Arc::new(HealthStats::new());
        let flush_stats = Arc::clone(&health_stats);
        handles.push(tokio::spawn(aggregator.clone().run_flush(
            FLUSH_PERIOD,
            cancel.clone(),
            move |elapsed, records| flush_stats.record_flush(elapsed, records),
        )));

        let table = SamplerTable::new();
        handles.extend(
            SamplerSet::with_roots(&config, &roots.proc_root, &roots.sys_root).spawn(
                &table,
                config.unavailable_retry(),
                &cancel,
            ),
        );

        let pipeline = Pipeline {
            capture_method: config
                .capture_method
                .clone()
                .unwrap_or_else(|| DEFAULT_CAPTURE_METHOD.into()),
            config,
            table,
            publisher: Publisher::new(STREAM_BACKLOG),
            aggregator,
            attributor,
            geo,
            capture,
            capture_available,
            ifaces,
            health_stats,
            metrics,
        };

        handles.push(tokio::spawn(pipeline.clone().run_publisher(cancel)));

        Ok((pipeline, PipelineTasks { handles }))
    }

    async fn run_publisher(self, cancel: CancellationToken) {
        let mut tracker = SustainabilityTracker::new(
            self.config.network_kwh_per_gb.unwrap_or(0.06),
            self.config.co2_intensity_g_per_kwh.unwrap_or(468.0),
        );
        let stats = Arc::clone(&self.health_stats);
        let publisher = self.publisher.clone();

        run_publish_loop(
            PUBLISH_PERIOD,
            publisher,
            cancel,
            move || self.assemble(&mut tracker),
            move |elapsed, size| stats.record_publish(elapsed, size),
        )
        .await;
    }

    /// Builds one snapshot from current state and refreshes self-telemetry.
    pub fn assemble(&self, tracker: &mut SustainabilityTracker) -> MetricSnapshot {
        let start = Instant::now();
        let sustainability = tracker.update(
            self.table.wattage(),
            self.table.network_total(),
            Instant::now(),
        );
        let capture_status = self.capture_status();
        let flows = self.aggregator.latest().as_ref().clone();
        let snapshot = self.table.snapshot(
            Reading::ok(sustainability, Utc::now()),
            flows,
            capture_status,
        );

        let geo = self.geo.stats();
        self.health_stats.record_geo_cache_size(geo.cached);
        if let Some(m) = &self.metrics {
            m.update_capture(&snapshot.capture_status);
            m.update_flows(&self.aggregator.stats());
            m.update_geo(&geo);
            m.update_samplers(&self.table.health());
            m.stream_clients.set(self.publisher.client_count() as f64);
            m.snapshot_assembly_seconds
                .set(start.elapsed().as_secs_f64());
        }
        snapshot
    }

    pub fn capture_status(&self) -> CaptureStatus {
        let flows = self.aggregator.stats();
        let geo = self.geo.stats();
        CaptureStatus {
            capture_available: self.capture_available,
            capture_method: self.capture_method.clone(),
            sniffer_running: self.capture.is_running(),
            sniffer_state: self.capture.state(),
            sniffer_error: self.capture.last_error(),
            restarts: self.capture.restarts(),
            line_count: self.capture.line_count(),
            packet_count: flows.packets,
            ignored_count: flows.ignored,
            local_match_count: flows.local_match,
            flow_keys: flows.flow_keys,
            geo_cached: geo.cached,
            geo_inflight: geo.inflight,
            local_ip_count: self.attributor.local_addrs().len(),
            ifaces: self.ifaces.clone(),
        }
    }
}

/// Returns true when `path` looks like a readable procfs.
pub fn has_procfs(path: &Path) -> bool {
    path.join("stat").exists() && path.join("net").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureState;
    use tempfile::tempdir;

    fn offline_config() -> Config {
        Config {
            capture_method: Some("none".into()),
            geoip_api_url: Some("http://127.0.0.1:9/{ip}".into()),
            geoip_fallback_urls: Some(Vec::new()),
            latency_target: Some("127.0.0.1".into()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_capture_reports_status() {
        let dir = tempdir().unwrap();
        let roots = HostRoots {
            proc_root: dir.path().join("proc"),
            sys_root: dir.path().join("sys"),
        };
        let cancel = CancellationToken::new();
        let (pipeline, tasks) =
            Pipeline::start_with_roots(Arc::new(offline_config()), None, roots, cancel.clone())
                .await
                .unwrap();

        let status = pipeline.capture_status();
        assert!(!status.capture_available);
        assert!(!status.sniffer_running);
        assert_eq!(status.sniffer_state, CaptureState::Stopped);
        assert_eq!(status.capture_method, "none");
        assert!(status
            .sniffer_error
            .as_deref()
            .is_some_and(|e| e.starts_with("capture-disabled")));

        let mut tracker = SustainabilityTracker::new(0.06, 468.0);
        let snapshot = pipeline.assemble(&mut tracker);
        assert!(snapshot.network_flows.is_empty());

        cancel.cancel();
        tasks.join().await;
    }

    #[tokio::test]
    async fn test_publisher_emits_snapshots() {
        let dir = tempdir().unwrap();
        let roots = HostRoots {
            proc_root: dir.path().join("proc"),
            sys_root: dir.path().join("sys"),
        };
        let registry = Registry::new();
        let cancel = CancellationToken::new();
        let (pipeline, tasks) = Pipeline::start_with_roots(
            Arc::new(offline_config()),
            Some(&registry),
            roots,
            cancel.clone(),
        )
        .await
        .unwrap();

        let mut sub = pipeline.publisher.subscribe();
        let msg = tokio::time::timeout(Duration::from_secs(3), sub.rx.recv())
            .await
            .expect("snapshot within the publish period")
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert!(json["battery"]["status"].is_string());
        assert_eq!(json["capture_status"]["capture_available"], false);
        assert!(json["network_flows"].is_array());

        cancel.cancel();
        tasks.join().await;
    }
}
