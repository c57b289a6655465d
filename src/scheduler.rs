//! Per-family sampling tasks and snapshot assembly.
//!
//! Each sampler runs in its own task at its own cadence and writes into a
//! slot. The publish loop only ever reads slots, so a slow or failing
//! sampler can never delay a tick.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::collectors::{
    BatteryReading, BatterySampler, CpuReading, CpuSampler, DiskReading, DiskSampler,
    EnergyReading, EnergySampler, LatencyReading, LatencySampler, MemoryReading, MemorySampler,
    NetworkReading, NetworkSampler, ProcessesReading, ProcessesSampler, Sampler, ThermalReading,
    ThermalSampler,
};
use crate::config::{CadenceConfig, Config, DEFAULT_LATENCY_TARGET};
use crate::error::SamplerError;
use crate::flow::FlowRecord;
use crate::publisher::Publisher;
use crate::snapshot::{CaptureStatus, MetricSnapshot, Reading, ReadingStatus};
use crate::sustainability::SustainabilityReading;

/// Lower bound for a single read; short cadences still get this long.
const MIN_SAMPLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Last known state of one sampler.
#[derive(Debug)]
pub struct SamplerState<T> {
    last_value: Option<T>,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
    unavailable: bool,
    attempted: bool,
    /// Period the task currently reads at: the family cadence, or the
    /// unavailable retry while backed off. Zero before the task starts.
    cadence: Duration,
}

impl<T> Default for SamplerState<T> {
    fn default() -> Self {
        Self {
            last_value: None,
            last_success: None,
            last_error: None,
            consecutive_failures: 0,
            unavailable: false,
            attempted: false,
            cadence: Duration::ZERO,
        }
    }
}

impl<T: Clone> SamplerState<T> {
    pub fn record_success(&mut self, value: T, at: DateTime<Utc>) {
        self.attempted = true;
        self.last_value = Some(value);
        self.last_success = Some(at);
        self.last_error = None;
        self.consecutive_failures = 0;
        self.unavailable = false;
    }

    pub fn record_failure(&mut self, err: &SamplerError) {
        self.attempted = true;
        self.last_error = Some(err.to_string());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.unavailable = err.is_permanent();
        if self.unavailable {
            self.last_value = None;
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    pub fn set_cadence(&mut self, cadence: Duration) {
        self.cadence = cadence;
    }

    pub fn status(&self) -> ReadingStatus {
        if !self.attempted {
            ReadingStatus::Pending
        } else if self.unavailable {
            ReadingStatus::Unavailable
        } else {
            match (&self.last_value, &self.last_error) {
                (Some(_), None) => ReadingStatus::Ok,
                (Some(_), Some(_)) => ReadingStatus::Stale,
                (None, _) => ReadingStatus::Failed,
            }
        }
    }

    pub fn reading(&self) -> Reading<T> {
        Reading {
            status: self.status(),
            error: self.last_error.clone(),
            updated_at: self.last_success,
            value: self.last_value.clone(),
        }
    }
}

pub type SamplerSlot<T> = Arc<RwLock<SamplerState<T>>>;

fn read_slot<T: Clone>(slot: &SamplerSlot<T>) -> Reading<T> {
    slot.read().unwrap_or_else(|e| e.into_inner()).reading()
}

/// Availability summary of one sampler, used by `/health` and `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct SamplerHealth {
    pub name: &'static str,
    pub status: ReadingStatus,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub cadence_secs: f64,
}

fn health_of<T: Clone>(name: &'static str, slot: &SamplerSlot<T>) -> SamplerHealth {
    let state = slot.read().unwrap_or_else(|e| e.into_inner());
    SamplerHealth {
        name,
        status: state.status(),
        consecutive_failures: state.consecutive_failures,
        last_success: state.last_success,
        cadence_secs: state.cadence.as_secs_f64(),
    }
}

/// Runs one sampler until cancelled. Permanent failures switch the task to
/// `unavailable_retry`; the first success after that restores `cadence`.
#[instrument(skip(sampler, slot, cancel), fields(sampler = sampler.name()))]
pub async fn run_sampler<S: Sampler>(
    mut sampler: S,
    slot: SamplerSlot<S::Output>,
    cadence: Duration,
    unavailable_retry: Duration,
    cancel: CancellationToken,
) {
    let name = sampler.name();
    let timeout = cadence.max(MIN_SAMPLE_TIMEOUT);
    let mut period = cadence;
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    slot.write()
        .unwrap_or_else(|e| e.into_inner())
        .set_cadence(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = time::timeout(timeout, sampler.sample()) => {
                r.unwrap_or(Err(SamplerError::Timeout(timeout)))
            }
        };

        let next_period = {
            let mut state = slot.write().unwrap_or_else(|e| e.into_inner());
            let next = match result {
                Ok(value) => {
                    if state.consecutive_failures() > 0 {
                        info!("Sampler {} recovered after {} failures", name, state.consecutive_failures());
                    }
                    state.record_success(value, Utc::now());
                    cadence
                }
                Err(e) => {
                    state.record_failure(&e);
                    if e.is_permanent() {
                        if period != unavailable_retry {
                            info!("Sampler {} unavailable, retrying every {:?}: {}", name, unavailable_retry, e);
                        }
                        unavailable_retry
                    } else {
                        warn!("Sampler {} read failed ({} in a row): {}", name, state.consecutive_failures(), e);
                        cadence
                    }
                }
            };
            state.set_cadence(next);
            next
        };

        if next_period != period {
            period = next_period;
            ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }
    }

    debug!("Sampler {} stopped", name);
}

/// One slot per sampled family.
#[derive(Clone, Default)]
pub struct SamplerTable {
    pub cpu: SamplerSlot<CpuReading>,
    pub memory: SamplerSlot<MemoryReading>,
    pub disk: SamplerSlot<DiskReading>,
    pub network: SamplerSlot<NetworkReading>,
    pub latency: SamplerSlot<LatencyReading>,
    pub thermal: SamplerSlot<ThermalReading>,
    pub energy: SamplerSlot<EnergyReading>,
    pub battery: SamplerSlot<BatteryReading>,
    pub processes: SamplerSlot<ProcessesReading>,
}

impl SamplerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn health(&self) -> Vec<SamplerHealth> {
        vec![
            health_of("cpu", &self.cpu),
            health_of("memory", &self.memory),
            health_of("disk", &self.disk),
            health_of("network", &self.network),
            health_of("latency", &self.latency),
            health_of("thermal", &self.thermal),
            health_of("energy", &self.energy),
            health_of("battery", &self.battery),
            health_of("processes", &self.processes),
        ]
    }

    /// Latest wattage, if the energy family has one.
    pub fn wattage(&self) -> Option<f64> {
        read_slot(&self.energy).value.and_then(|e| e.wattage)
    }

    /// Cumulative sent+received bytes, if the network family has a value.
    pub fn network_total(&self) -> Option<u64> {
        read_slot(&self.network)
            .value
            .map(|n| n.bytes_sent.saturating_add(n.bytes_recv))
    }

    /// Builds a snapshot from whatever the slots hold right now.
    pub fn snapshot(
        &self,
        sustainability: Reading<SustainabilityReading>,
        network_flows: Vec<FlowRecord>,
        capture_status: CaptureStatus,
    ) -> MetricSnapshot {
        MetricSnapshot {
            timestamp: Utc::now(),
            cpu: read_slot(&self.cpu),
            memory: read_slot(&self.memory),
            disk: read_slot(&self.disk),
            network: read_slot(&self.network),
            latency: read_slot(&self.latency),
            thermal: read_slot(&self.thermal),
            energy: read_slot(&self.energy),
            battery: read_slot(&self.battery),
            sustainability,
            processes: read_slot(&self.processes),
            network_flows,
            capture_status,
        }
    }
}

/// The concrete samplers for this host.
pub struct SamplerSet {
    pub cpu: CpuSampler,
    pub memory: MemorySampler,
    pub disk: DiskSampler,
    pub network: NetworkSampler,
    pub latency: LatencySampler,
    pub thermal: ThermalSampler,
    pub energy: EnergySampler,
    pub battery: BatterySampler,
    pub processes: ProcessesSampler,
    pub cadences: CadenceConfig,
}

impl SamplerSet {
    pub fn for_host(config: &Config) -> Self {
        Self::with_roots(config, Path::new("/proc"), Path::new("/sys"))
    }

    pub fn with_roots(config: &Config, proc_root: &Path, sys_root: &Path) -> Self {
        Self {
            cpu: CpuSampler::new(proc_root),
            memory: MemorySampler::new(proc_root),
            disk: DiskSampler::new(proc_root),
            network: NetworkSampler::new(proc_root),
            latency: LatencySampler::new(
                config
                    .latency_target
                    .as_deref()
                    .unwrap_or(DEFAULT_LATENCY_TARGET),
            ),
            thermal: ThermalSampler::new(sys_root),
            energy: EnergySampler::new(sys_root),
            battery: BatterySampler::new(sys_root),
            processes: ProcessesSampler::new(proc_root, config.top_processes.unwrap_or(5)),
            cadences: config.cadences.clone(),
        }
    }

    /// Spawns one task per sampler writing into `table`.
    pub fn spawn(
        self,
        table: &SamplerTable,
        unavailable_retry: Duration,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let c = &self.cadences;
        let secs = Duration::from_secs;
        vec![
            tokio::spawn(run_sampler(self.cpu, table.cpu.clone(), secs(c.cpu), unavailable_retry, cancel.clone())),
            tokio::spawn(run_sampler(self.memory, table.memory.clone(), secs(c.memory), unavailable_retry, cancel.clone())),
            tokio::spawn(run_sampler(self.disk, table.disk.clone(), secs(c.disk), unavailable_retry, cancel.clone())),
            tokio::spawn(run_sampler(self.network, table.network.clone(), secs(c.network), unavailable_retry, cancel.clone())),
            tokio::spawn(run_sampler(self.latency, table.latency.clone(), secs(c.latency), unavailable_retry, cancel.clone())),
            tokio::spawn(run_sampler(self.thermal, table.thermal.clone(), secs(c.thermal), unavailable_retry, cancel.clone())),
            tokio::spawn(run_sampler(self.energy, table.energy.clone(), secs(c.energy), unavailable_retry, cancel.clone())),
            tokio::spawn(run_sampler(self.battery, table.battery.clone(), secs(c.battery), unavailable_retry, cancel.clone())),
            tokio::spawn(run_sampler(self.processes, table.processes.clone(), secs(c.processes), unavailable_retry, cancel.clone())),
        ]
    }
}

/// Publishes one snapshot per `period` until cancelled. `assemble` must not
/// block; it only reads already-sampled state. `on_publish` receives the
/// tick duration and serialized size.
#[instrument(skip(publisher, cancel, assemble, on_publish))]
pub async fn run_publish_loop<F, P>(
    period: Duration,
    publisher: Publisher,
    cancel: CancellationToken,
    mut assemble: F,
    on_publish: P,
) where
    F: FnMut() -> MetricSnapshot + Send,
    P: Fn(Duration, usize) + Send,
{
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Publish loop started with period {:?}", period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let start = Instant::now();
        let snapshot = assemble();
        match publisher.publish(&snapshot) {
            Ok(size) => {
                let elapsed = start.elapsed();
                on_publish(elapsed, size);
                debug!(
                    "Published {} byte snapshot to {} clients in {:?}",
                    size,
                    publisher.client_count(),
                    elapsed
                );
            }
            Err(e) => warn!("Failed to serialize snapshot: {}", e),
        }
    }

    info!("Publish loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Succeeds on the first read, then fails `failures` times, then succeeds.
    struct Flaky {
        calls: u32,
        failures: u32,
    }

    impl Sampler for Flaky {
        type Output = u32;

        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn sample(&mut self) -> Result<u32, SamplerError> {
            self.calls += 1;
            if self.calls == 1 || self.calls > self.failures + 1 {
                Ok(self.calls)
            } else {
                Err(SamplerError::Parse("garbled".into()))
            }
        }
    }

    struct Missing;

    impl Sampler for Missing {
        type Output = u32;

        fn name(&self) -> &'static str {
            "missing"
        }

        async fn sample(&mut self) -> Result<u32, SamplerError> {
            Err(SamplerError::Unavailable("no such sensor".into()))
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut state: SamplerState<u32> = SamplerState::default();
        assert_eq!(state.reading().status, ReadingStatus::Pending);

        state.record_failure(&SamplerError::Parse("bad".into()));
        assert_eq!(state.reading().status, ReadingStatus::Failed);

        state.record_success(7, Utc::now());
        assert_eq!(state.reading().status, ReadingStatus::Ok);

        state.record_failure(&SamplerError::Parse("bad".into()));
        let reading = state.reading();
        assert_eq!(reading.status, ReadingStatus::Stale);
        assert_eq!(reading.value, Some(7));
        assert!(reading.error.is_some());

        state.record_failure(&SamplerError::Unavailable("gone".into()));
        let reading = state.reading();
        assert_eq!(reading.status, ReadingStatus::Unavailable);
        assert_eq!(reading.value, None);
    }

    #[tokio::test]
    async fn test_flaky_sampler_keeps_last_value() {
        let slot: SamplerSlot<u32> = Arc::default();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sampler(
            Flaky { calls: 0, failures: 5 },
            slot.clone(),
            Duration::from_millis(10),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        // Wait until the failures start piling up.
        for _ in 0..200 {
            if slot.read().unwrap().consecutive_failures() >= 3 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }

        let reading = read_slot(&slot);
        assert_eq!(reading.status, ReadingStatus::Stale);
        assert_eq!(reading.value, Some(1));
        // Transient failures keep the regular cadence
        assert_eq!(slot.read().unwrap().cadence(), Duration::from_millis(10));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_sampler_backs_off() {
        let slot: SamplerSlot<u32> = Arc::default();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sampler(
            Missing,
            slot.clone(),
            Duration::from_millis(5),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        time::sleep(Duration::from_millis(100)).await;
        let state = slot.read().unwrap();
        assert_eq!(state.status(), ReadingStatus::Unavailable);
        // Only the first attempt ran; the retry is a minute away.
        assert_eq!(state.consecutive_failures(), 1);
        assert_eq!(state.cadence(), Duration::from_secs(60));
        drop(state);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_loop_ticks_while_samplers_fail() {
        let table = SamplerTable::new();
        let publisher = Publisher::new(16);
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicU32::new(0));

        let flaky = tokio::spawn(run_sampler(
            Flaky { calls: 0, failures: u32::MAX - 1 },
            Arc::default(),
            Duration::from_millis(5),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        let t = table.clone();
        let counter = ticks.clone();
        let publish = tokio::spawn(run_publish_loop(
            Duration::from_millis(10),
            publisher.clone(),
            cancel.clone(),
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
                t.snapshot(Reading::pending(), Vec::new(), CaptureStatus::default())
            },
            |_, size| assert!(size > 0),
        ));

        time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        publish.await.unwrap();
        flaky.await.unwrap();

        assert!(ticks.load(Ordering::Relaxed) >= 5);
        let latest = publisher.latest().expect("a snapshot was published");
        assert!(latest.contains("\"capture_status\""));
    }

    #[test]
    fn test_snapshot_reports_pending_families() {
        let table = SamplerTable::new();
        let snapshot = table.snapshot(Reading::pending(), Vec::new(), CaptureStatus::default());
        assert_eq!(snapshot.cpu.status, ReadingStatus::Pending);
        assert_eq!(table.health().len(), 9);
        assert!(table.health().iter().all(|h| h.cadence_secs == 0.0));
        assert_eq!(table.wattage(), None);
        assert_eq!(table.network_total(), None);
    }
}
