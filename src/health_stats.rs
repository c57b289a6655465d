//! Health statistics for the pipeline itself.
//!
//! Tracks tick, flush and request timings and renders them, together with
//! per-sampler and capture status, as the plain-text `/health` page.

use std::collections::VecDeque;
use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::scheduler::SamplerHealth;
use crate::snapshot::CaptureStatus;

/// Running statistics for a single metric.
#[derive(Clone, Copy, Default)]
pub struct RunningStat {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl RunningStat {
    pub fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
            self.last = value;
            self.sum = value;
            self.count = 1;
            return;
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / (self.count as f64)
        }
    }
}

/// Thread-safe wrapper for running statistics.
#[derive(Default)]
pub struct Stat {
    inner: Mutex<RunningStat>,
}

/// (last, avg, max, min, count)
pub type StatSnapshot = (f64, f64, f64, f64, u64);

impl Stat {
    pub fn add_sample(&self, value: f64) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).add(value);
    }

    pub fn snapshot(&self) -> StatSnapshot {
        let s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (s.last, s.avg(), s.max, s.min, s.count)
    }
}

/// Sliding window of request timestamps.
pub struct RequestTimestamps {
    inner: Mutex<VecDeque<Instant>>,
}

impl Default for RequestTimestamps {
    fn default() -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(1024)),
        }
    }
}

impl RequestTimestamps {
    pub fn record(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        guard.push_back(now);
        // Keep only last 10 minutes of timestamps
        while guard
            .front()
            .is_some_and(|&t| now.duration_since(t) > Duration::from_secs(600))
        {
            guard.pop_front();
        }
    }

    pub fn count_last_minute(&self) -> u64 {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .iter()
            .filter(|t| t.elapsed() <= Duration::from_secs(60))
            .count() as u64
    }
}

pub struct HealthStats {
    pub publish_duration_ms: Stat,
    pub flush_duration_ms: Stat,
    pub flow_records_per_flush: Stat,
    pub snapshot_size_kb: Stat,
    pub geo_cache_size: Stat,
    pub total_ticks: AtomicU64,

    pub http_request_timestamps: RequestTimestamps,
    pub request_duration_ms: Stat,

    pub start_time: Instant,
}

impl Default for HealthStats {
    fn default() -> Self {
        Self {
            publish_duration_ms: Stat::default(),
            flush_duration_ms: Stat::default(),
            flow_records_per_flush: Stat::default(),
            snapshot_size_kb: Stat::default(),
            geo_cache_size: Stat::default(),
            total_ticks: AtomicU64::new(0),
            http_request_timestamps: RequestTimestamps::default(),
            request_duration_ms: Stat::default(),
            start_time: Instant::now(),
        }
    }
}

const LEFT_COL: usize = 26;
const COL_W: usize = 12;

fn write_row(out: &mut String, label: &str, cols: [String; 4]) {
    let [cur, avg, max, min] = cols;
    writeln!(
        out,
        "{:left$} | {:^col$} | {:^col$} | {:^col$} | {:^col$}",
        label,
        cur,
        avg,
        max,
        min,
        left = LEFT_COL,
        col = COL_W
    )
    .ok();
}

fn stat_row(out: &mut String, label: &str, snap: StatSnapshot, precision: usize) {
    let (cur, avg, max, min, _) = snap;
    write_row(
        out,
        label,
        [
            format!("{:.*}", precision, cur),
            format!("{:.*}", precision, avg),
            format!("{:.*}", precision, max),
            format!("{:.*}", precision, min),
        ],
    );
}

fn section(out: &mut String, title: &str) {
    writeln!(out).ok();
    writeln!(out, "{title}").ok();
    writeln!(out, "{}", "-".repeat(title.len())).ok();
}

impl HealthStats {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record_publish(&self, duration: Duration, size_bytes: usize) {
        self.publish_duration_ms
            .add_sample(duration.as_secs_f64() * 1000.0);
        self.snapshot_size_kb.add_sample(size_bytes as f64 / 1024.0);
        self.total_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, duration: Duration, records: usize) {
        self.flush_duration_ms
            .add_sample(duration.as_secs_f64() * 1000.0);
        self.flow_records_per_flush.add_sample(records as f64);
    }

    pub fn record_geo_cache_size(&self, size: usize) {
        self.geo_cache_size.add_sample(size as f64);
    }

    pub fn record_http_request(&self, duration: Duration) {
        self.http_request_timestamps.record();
        self.request_duration_ms
            .add_sample(duration.as_secs_f64() * 1000.0);
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn render_table(&self, samplers: &[SamplerHealth], capture: &CaptureStatus) -> String {
        let mut out = String::new();

        writeln!(out, "HEALTH ENDPOINT - PIPELINE INTERNAL STATS").ok();
        writeln!(out, "=========================================").ok();
        writeln!(out).ok();

        write_row(
            &mut out,
            "",
            ["current".into(), "average".into(), "max".into(), "min".into()],
        );

        section(&mut out, "PUBLISH LOOP");
        stat_row(&mut out, "tick_duration (ms)", self.publish_duration_ms.snapshot(), 2);
        stat_row(&mut out, "snapshot_size (KB)", self.snapshot_size_kb.snapshot(), 1);
        writeln!(
            out,
            "{:left$} | {}",
            "total_ticks",
            self.total_ticks.load(Ordering::Relaxed),
            left = LEFT_COL
        )
        .ok();

        section(&mut out, "FLOWS");
        stat_row(&mut out, "flush_duration (ms)", self.flush_duration_ms.snapshot(), 2);
        stat_row(&mut out, "records_per_flush", self.flow_records_per_flush.snapshot(), 0);
        stat_row(&mut out, "geo_cache_size", self.geo_cache_size.snapshot(), 0);

        section(&mut out, "HTTP SERVER");
        write_row(
            &mut out,
            "http_requests_last_minute",
            [
                self.http_request_timestamps.count_last_minute().to_string(),
                "N/A".into(),
                "N/A".into(),
                "N/A".into(),
            ],
        );
        stat_row(&mut out, "request_duration (ms)", self.request_duration_ms.snapshot(), 1);

        section(&mut out, "CAPTURE");
        let kv = |out: &mut String, key: &str, value: String| {
            writeln!(out, "{:left$} | {}", key, value, left = LEFT_COL).ok();
        };
        kv(&mut out, "method", capture.capture_method.clone());
        kv(&mut out, "state", capture.sniffer_state.to_string());
        kv(&mut out, "interfaces", capture.ifaces.join(","));
        kv(&mut out, "restarts", capture.restarts.to_string());
        kv(&mut out, "lines", capture.line_count.to_string());
        kv(&mut out, "packets", capture.packet_count.to_string());
        kv(&mut out, "ignored", capture.ignored_count.to_string());
        kv(&mut out, "local_match", capture.local_match_count.to_string());
        kv(
            &mut out,
            "last_error",
            capture.sniffer_error.clone().unwrap_or_else(|| "-".into()),
        );

        section(&mut out, "SAMPLERS");
        for s in samplers {
            let last = s
                .last_success
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "never".into());
            writeln!(
                out,
                "{:left$} | {:^col$} | every {:>6.1}s | failures {:>4} | last ok {}",
                s.name,
                s.status.as_str(),
                s.cadence_secs,
                s.consecutive_failures,
                last,
                left = LEFT_COL,
                col = COL_W
            )
            .ok();
        }

        writeln!(out).ok();
        writeln!(
            out,
            "uptime: {:.2} h",
            self.start_time.elapsed().as_secs_f64() / 3600.0
        )
        .ok();

        out
    }
}
