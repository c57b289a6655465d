//! Turns capture lines into per-interval flow records.
//!
//! `ingest_line` parses, classifies and accumulates under the table lock.
//! `flush` drains the table under the same lock, so every byte lands in
//! exactly one flush, then attributes and geolocates the drained entries
//! without holding it. Attribution and geolocation are cache reads; misses
//! come back as "Unknown" / null coordinates and fill in on later flushes.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::classify::{classify, LocalAddrs};
use super::record::FlowRecord;
use super::table::FlowTable;
use crate::capture::parse::parse_line;
use crate::capture::CaptureLines;
use crate::geo::GeoResolver;
use crate::process::{AttributionQuery, ProcessAttributor};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Default)]
struct Counters {
    lines: AtomicU64,
    packets: AtomicU64,
    ignored: AtomicU64,
    local_match: AtomicU64,
    unparsed: AtomicU64,
    flushes: AtomicU64,
    emitted: AtomicU64,
}

/// Counter snapshot for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub lines: u64,
    /// Lines that parsed as packets.
    pub packets: u64,
    /// Unparsable lines plus packets that were not local-to-public.
    pub ignored: u64,
    pub local_match: u64,
    pub unparsed: u64,
    /// Keys in the most recent flush.
    pub flow_keys: usize,
    pub flushes: u64,
    pub emitted: u64,
}

struct Interval {
    table: FlowTable,
    started: Instant,
}

struct Inner {
    interval: Mutex<Interval>,
    local: LocalAddrs,
    attributor: ProcessAttributor,
    geo: GeoResolver,
    max_flow_items: usize,
    counters: Counters,
    flow_keys: AtomicUsize,
    latest: RwLock<Arc<Vec<FlowRecord>>>,
}

#[derive(Clone)]
pub struct FlowAggregator {
    inner: Arc<Inner>,
}

impl FlowAggregator {
    pub fn new(
        local: LocalAddrs,
        attributor: ProcessAttributor,
        geo: GeoResolver,
        max_flow_items: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                interval: Mutex::new(Interval {
                    table: FlowTable::new(),
                    started: Instant::now(),
                }),
                local,
                attributor,
                geo,
                max_flow_items,
                counters: Counters::default(),
                flow_keys: AtomicUsize::new(0),
                latest: RwLock::new(Arc::new(Vec::new())),
            }),
        }
    }

    fn interval(&self) -> std::sync::MutexGuard<'_, Interval> {
        self.inner.interval.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Processes one raw capture line. Never fails; rejects are counted.
    pub fn ingest_line(&self, line: &str) {
        let c = &self.inner.counters;
        c.lines.fetch_add(1, Ordering::Relaxed);

        let Some(packet) = parse_line(line) else {
            c.unparsed.fetch_add(1, Ordering::Relaxed);
            c.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        };
        c.packets.fetch_add(1, Ordering::Relaxed);

        let Some(classified) = classify(&packet, &self.inner.local) else {
            c.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        };
        c.local_match.fetch_add(1, Ordering::Relaxed);

        if packet.length == 0 {
            return;
        }

        self.interval().table.record(
            classified.key,
            packet.length,
            classified.remote_port,
            classified.local_port,
            packet.protocol,
            Utc::now(),
        );
    }

    /// Drains the current interval using the measured elapsed time.
    pub fn flush(&self) -> Vec<FlowRecord> {
        self.flush_inner(None)
    }

    /// Drains the current interval, computing rates over `elapsed`.
    pub fn flush_with_elapsed(&self, elapsed: Duration) -> Vec<FlowRecord> {
        self.flush_inner(Some(elapsed))
    }

    fn flush_inner(&self, elapsed: Option<Duration>) -> Vec<FlowRecord> {
        let (entries, measured) = {
            let mut interval = self.interval();
            let now = Instant::now();
            let measured = now.duration_since(interval.started);
            interval.started = now;
            (interval.table.drain(), measured)
        };
        let secs = elapsed.unwrap_or(measured).as_secs_f64().max(1e-6);

        let mut records: Vec<FlowRecord> = entries
            .into_iter()
            .map(|(key, entry)| {
                let app = self.inner.attributor.attribute(&AttributionQuery {
                    direction: key.direction,
                    remote_ip: key.remote_ip,
                    remote_port: entry.remote_port,
                    local_port: entry.local_port,
                    protocol: entry.protocol,
                });
                let geo = self.inner.geo.lookup(key.remote_ip);

                let mut record = FlowRecord {
                    direction: key.direction,
                    remote_ip: key.remote_ip,
                    remote_port: entry.remote_port,
                    protocol: entry.protocol,
                    app,
                    country: None,
                    country_code: None,
                    city: None,
                    lat: None,
                    lon: None,
                    bytes: entry.bytes,
                    mb_s: entry.bytes as f64 / secs / BYTES_PER_MB,
                    last_seen: entry.last_seen,
                };
                record.apply_geo(geo.location());
                record
            })
            .collect();

        let keys = records.len();
        records.sort_by(|a, b| {
            b.bytes
                .cmp(&a.bytes)
                .then_with(|| a.remote_ip.cmp(&b.remote_ip))
                .then_with(|| (a.direction as u8).cmp(&(b.direction as u8)))
        });
        records.truncate(self.inner.max_flow_items);

        let c = &self.inner.counters;
        c.flushes.fetch_add(1, Ordering::Relaxed);
        c.emitted.fetch_add(records.len() as u64, Ordering::Relaxed);
        self.inner.flow_keys.store(keys, Ordering::Relaxed);
        *self.inner.latest.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(records.clone());

        if keys > 0 {
            debug!("Flushed {} flow keys ({} emitted)", keys, records.len());
        }
        records
    }

    /// Records from the most recent flush.
    pub fn latest(&self) -> Arc<Vec<FlowRecord>> {
        Arc::clone(&self.inner.latest.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn stats(&self) -> AggregatorStats {
        let c = &self.inner.counters;
        AggregatorStats {
            lines: c.lines.load(Ordering::Relaxed),
            packets: c.packets.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            local_match: c.local_match.load(Ordering::Relaxed),
            unparsed: c.unparsed.load(Ordering::Relaxed),
            flow_keys: self.inner.flow_keys.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            emitted: c.emitted.load(Ordering::Relaxed),
        }
    }

    /// Consumes capture lines until the stream ends or shutdown.
    #[instrument(skip_all)]
    pub async fn run_ingest(self, mut lines: CaptureLines, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Some(line) => self.ingest_line(&line),
                    None => {
                        info!("Capture line stream ended");
                        break;
                    }
                },
            }
        }
    }

    /// Flushes every `period` until shutdown. `on_flush` receives the flush
    /// duration and the number of records emitted.
    #[instrument(skip(self, cancel, on_flush))]
    pub async fn run_flush<F>(self, period: Duration, cancel: CancellationToken, on_flush: F)
    where
        F: Fn(Duration, usize) + Send,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; consume it so intervals are full.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let records = self.flush();
                    on_flush(start.elapsed(), records.len());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GeoError;
    use crate::flow::record::Direction;
    use crate::geo::{GeoLocation, GeoLookup, GeoSettings};
    use crate::process::ConnectionTable;
    use std::net::IpAddr;

    struct NeverResolves;

    impl GeoLookup for NeverResolves {
        async fn lookup(&self, _ip: IpAddr) -> Result<GeoLocation, GeoError> {
            std::future::pending().await
        }
    }

    fn aggregator() -> FlowAggregator {
        let local = LocalAddrs::from_addrs(["192.168.1.10".parse().unwrap()]);
        let attributor = ProcessAttributor::new(local.clone());
        attributor.replace_table(ConnectionTable::default());
        let geo = GeoResolver::start(NeverResolves, &GeoSettings::default(), CancellationToken::new());
        FlowAggregator::new(local, attributor, geo, 24)
    }

    #[tokio::test]
    async fn test_conservation_per_key() {
        let agg = aggregator();
        let lines = [
            "1.0 IP 192.168.1.10.50000 > 203.0.113.5.443: tcp 100",
            "1.1 IP 192.168.1.10.50000 > 203.0.113.5.443: tcp 250",
            "1.2 IP 203.0.113.5.443 > 192.168.1.10.50000: tcp 40",
            "1.3 IP 192.168.1.10.50001 > 203.0.113.5.443: tcp 10",
        ];
        for l in lines {
            agg.ingest_line(l);
        }
        let records = agg.flush_with_elapsed(Duration::from_secs(1));
        assert_eq!(records.len(), 2);

        let out = records
            .iter()
            .find(|r| r.direction == Direction::Outbound)
            .unwrap();
        let inb = records
            .iter()
            .find(|r| r.direction == Direction::Inbound)
            .unwrap();
        assert_eq!(out.bytes, 360);
        assert_eq!(inb.bytes, 40);
    }

    #[tokio::test]
    async fn test_private_only_lines_are_ignored() {
        let agg = aggregator();
        agg.ingest_line("1.0 IP 192.168.1.10.50000 > 192.168.1.1.53: UDP, length 60");
        agg.ingest_line("1.0 IP 10.0.0.5.1 > 10.0.0.6.2: tcp 60");
        agg.ingest_line("garbage");

        let stats = agg.stats();
        assert_eq!(stats.ignored, 3);
        assert_eq!(stats.local_match, 0);
        assert_eq!(stats.unparsed, 1);
        assert!(agg.flush().is_empty());
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let agg = aggregator();
        agg.ingest_line("1.0 IP 192.168.1.10.50000 > 203.0.113.5.443: tcp 100");
        assert_eq!(agg.flush().len(), 1);
        assert!(agg.flush().is_empty());
        assert!(agg.latest().is_empty());
    }

    #[tokio::test]
    async fn test_zero_length_counts_but_adds_nothing() {
        let agg = aggregator();
        agg.ingest_line("1.0 IP 192.168.1.10.50000 > 203.0.113.5.443: tcp 0");
        assert_eq!(agg.stats().local_match, 1);
        assert!(agg.flush().is_empty());
    }

    #[tokio::test]
    async fn test_truncates_to_largest_flows() {
        let local = LocalAddrs::from_addrs(["192.168.1.10".parse().unwrap()]);
        let attributor = ProcessAttributor::new(local.clone());
        let geo = GeoResolver::start(NeverResolves, &GeoSettings::default(), CancellationToken::new());
        let agg = FlowAggregator::new(local, attributor, geo, 2);

        for (i, len) in [10u32, 500, 30, 200].iter().enumerate() {
            agg.ingest_line(&format!(
                "1.0 IP 192.168.1.10.50000 > 203.0.113.{}.443: tcp {}",
                i + 1,
                len
            ));
        }
        let records = agg.flush();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bytes, 500);
        assert_eq!(records[1].bytes, 200);
        assert_eq!(agg.stats().flow_keys, 4);
    }
}
