//! Coalescing geolocation cache.
//!
//! `GeoResolver` is a cheap cloneable handle. Queries never block: a miss
//! registers the IP as in flight and hands it to a background worker, which
//! runs at most `max_concurrent` lookups at a time. A result lands in the
//! cache before its in-flight entry is cleared, so there is never more than
//! one outstanding lookup per IP.

use ahash::AHashMap as HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::provider::GeoLookup;
use super::{GeoLocation, GeoSettings, GeoStatus};
use crate::flow::classify::is_public_ip;

enum CacheEntry {
    Resolved(GeoLocation),
    Failed { until: Instant },
}

#[derive(Default)]
struct ResolverState {
    cache: HashMap<IpAddr, CacheEntry>,
    inflight: HashMap<IpAddr, watch::Receiver<bool>>,
}

#[derive(Default)]
struct Counters {
    lookups: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Cache and lookup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeoStats {
    pub cached: usize,
    pub negative: usize,
    pub inflight: usize,
    pub lookups: u64,
    pub successes: u64,
    pub failures: u64,
}

struct Shared {
    state: Mutex<ResolverState>,
    counters: Counters,
    negative_ttl: Duration,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registration of one in-flight lookup. Dropping it clears the in-flight
/// entry and wakes waiters on every path: completion, cancellation, a
/// panicking provider, or a request that never reached the worker.
struct InflightLookup {
    shared: Arc<Shared>,
    ip: IpAddr,
    done: watch::Sender<bool>,
}

impl InflightLookup {
    fn finish(self, entry: CacheEntry) {
        self.shared.state().cache.insert(self.ip, entry);
    }
}

impl Drop for InflightLookup {
    fn drop(&mut self) {
        self.shared.state().inflight.remove(&self.ip);
        let _ = self.done.send(true);
    }
}

#[derive(Clone)]
pub struct GeoResolver {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<InflightLookup>,
}

impl GeoResolver {
    /// Spawns the lookup worker and returns a handle to it.
    pub fn start<L: GeoLookup>(
        lookup: L,
        settings: &GeoSettings,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ResolverState::default()),
            counters: Counters::default(),
            negative_ttl: settings.negative_ttl,
        });
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_worker(
            Arc::new(lookup),
            Arc::clone(&shared),
            rx,
            settings.max_concurrent.max(1),
            cancel,
        ));
        info!(
            "Geolocation resolver started (max_concurrent={}, negative_ttl={:?})",
            settings.max_concurrent, settings.negative_ttl
        );

        Self {
            shared,
            requests: tx,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ResolverState> {
        self.shared.state()
    }

    /// Answers from cache, or schedules a lookup and returns the receiver
    /// that fires when it completes.
    fn check_or_schedule(&self, ip: IpAddr) -> Result<GeoStatus, watch::Receiver<bool>> {
        if !is_public_ip(ip) {
            return Ok(GeoStatus::NotApplicable);
        }

        let mut state = self.state();
        match state.cache.get(&ip) {
            Some(CacheEntry::Resolved(loc)) => return Ok(GeoStatus::Resolved(loc.clone())),
            Some(CacheEntry::Failed { until }) if Instant::now() < *until => {
                return Ok(GeoStatus::Failed)
            }
            _ => {}
        }

        if let Some(rx) = state.inflight.get(&ip) {
            return Err(rx.clone());
        }

        let (done_tx, done_rx) = watch::channel(false);
        let request = InflightLookup {
            shared: Arc::clone(&self.shared),
            ip,
            done: done_tx,
        };
        if let Err(rejected) = self.requests.send(request) {
            // Worker is gone (shutdown); nothing will ever resolve this.
            // The rejected request locks the state when dropped.
            drop(state);
            drop(rejected);
            return Ok(GeoStatus::Failed);
        }
        state.inflight.insert(ip, done_rx.clone());
        Err(done_rx)
    }

    /// Non-blocking query used by the flush path.
    pub fn lookup(&self, ip: IpAddr) -> GeoStatus {
        self.check_or_schedule(ip).unwrap_or(GeoStatus::Pending)
    }

    /// Like `lookup`, but waits for an in-flight or newly scheduled lookup
    /// to finish. Concurrent callers share the same request.
    pub async fn resolve_wait(&self, ip: IpAddr) -> GeoStatus {
        let mut done = match self.check_or_schedule(ip) {
            Ok(status) => return status,
            Err(rx) => rx,
        };
        if done.wait_for(|finished| *finished).await.is_err() {
            return GeoStatus::Failed;
        }
        self.cached(ip)
    }

    /// Cache-only read that never schedules work.
    pub fn cached(&self, ip: IpAddr) -> GeoStatus {
        if !is_public_ip(ip) {
            return GeoStatus::NotApplicable;
        }
        let state = self.state();
        match state.cache.get(&ip) {
            Some(CacheEntry::Resolved(loc)) => GeoStatus::Resolved(loc.clone()),
            Some(CacheEntry::Failed { until }) if Instant::now() < *until => GeoStatus::Failed,
            _ if state.inflight.contains_key(&ip) => GeoStatus::Pending,
            _ => GeoStatus::Failed,
        }
    }

    /// Seeds the cache with a known location.
    pub fn insert(&self, ip: IpAddr, location: GeoLocation) {
        if is_public_ip(ip) {
            self.state().cache.insert(ip, CacheEntry::Resolved(location));
        }
    }

    pub fn stats(&self) -> GeoStats {
        let state = self.state();
        let negative = state
            .cache
            .values()
            .filter(|e| matches!(e, CacheEntry::Failed { .. }))
            .count();
        let counters = &self.shared.counters;
        GeoStats {
            cached: state.cache.len() - negative,
            negative,
            inflight: state.inflight.len(),
            lookups: counters.lookups.load(Ordering::Relaxed),
            successes: counters.successes.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker<L: GeoLookup>(
    lookup: Arc<L>,
    shared: Arc<Shared>,
    mut requests: mpsc::UnboundedReceiver<InflightLookup>,
    max_concurrent: usize,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent));

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            req = requests.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let lookup = Arc::clone(&lookup);
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let ip = request.ip;
            shared.counters.lookups.fetch_add(1, Ordering::Relaxed);

            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = lookup.lookup(ip) => result,
            };

            match result {
                Ok(location) => {
                    debug!("Geolocated {} -> {:.2},{:.2}", ip, location.lat, location.lon);
                    shared.counters.successes.fetch_add(1, Ordering::Relaxed);
                    request.finish(CacheEntry::Resolved(location));
                }
                Err(e) => {
                    warn!("Geolocation failed for {}: {}", ip, e);
                    shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                    request.finish(CacheEntry::Failed {
                        until: Instant::now() + shared.negative_ttl,
                    });
                }
            }
        });
    }

    debug!("Geolocation worker stopped");
}
