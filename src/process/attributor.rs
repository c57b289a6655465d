//! Maps remote endpoints to local process names.
//!
//! A refresh task rebuilds the connection table on a fixed cadence (and the
//! set of local addresses with it). Lookups only ever read the most recent
//! snapshot, so they never wait on procfs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::connections::{AttributionQuery, ConnectionSource, ConnectionTable};
use crate::flow::classify::LocalAddrs;

pub const UNKNOWN_APP: &str = "Unknown";

#[derive(Clone)]
pub struct ProcessAttributor {
    table: Arc<RwLock<Arc<ConnectionTable>>>,
    local: LocalAddrs,
    refreshes: Arc<AtomicU64>,
}

impl ProcessAttributor {
    pub fn new(local: LocalAddrs) -> Self {
        Self {
            table: Arc::new(RwLock::new(Arc::new(ConnectionTable::default()))),
            local,
            refreshes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn local_addrs(&self) -> &LocalAddrs {
        &self.local
    }

    fn current(&self) -> Arc<ConnectionTable> {
        Arc::clone(&self.table.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Process name for the endpoint, or `"Unknown"`.
    pub fn attribute(&self, query: &AttributionQuery) -> String {
        self.current()
            .attribute(query)
            .unwrap_or(UNKNOWN_APP)
            .to_string()
    }

    pub fn replace_table(&self, table: ConnectionTable) {
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_count(&self) -> usize {
        self.current().len()
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Takes one snapshot off the async runtime and installs it. On error
    /// the previous snapshot stays in place.
    pub async fn refresh_once<S: ConnectionSource>(&self, source: &Arc<S>, discover_local: bool) {
        let source = Arc::clone(source);
        let result = tokio::task::spawn_blocking(move || {
            let table = source.snapshot();
            let local = discover_local.then(LocalAddrs::discover);
            (table, local)
        })
        .await;

        match result {
            Ok((table, local)) => {
                if let Some(addrs) = local {
                    self.local.replace(addrs);
                }
                match table {
                    Ok(table) => {
                        debug!("Connection table refreshed: {} sockets", table.len());
                        self.replace_table(table);
                    }
                    Err(e) => warn!("Connection table refresh failed: {}", e),
                }
            }
            Err(e) => warn!("Connection refresh task panicked: {}", e),
        }
    }

    /// Refreshes every `period` until cancelled.
    #[instrument(skip(self, source, cancel))]
    pub async fn run_refresh_loop<S: ConnectionSource>(
        self,
        source: Arc<S>,
        period: Duration,
        discover_local: bool,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.refresh_once(&source, discover_local).await,
            }
        }
        debug!("Attribution refresh loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::record::{Direction, Protocol};
    use crate::process::connections::{OwnedSocket, SocketEntry};
    use std::sync::atomic::AtomicUsize;

    struct FixedSource {
        calls: AtomicUsize,
    }

    impl ConnectionSource for FixedSource {
        fn snapshot(&self) -> std::io::Result<ConnectionTable> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n > 0 {
                return Err(std::io::Error::other("gone"));
            }
            Ok(ConnectionTable::new(vec![OwnedSocket {
                socket: SocketEntry {
                    protocol: Protocol::Tcp,
                    local: "192.168.1.10:50000".parse().unwrap(),
                    remote: "203.0.113.5:443".parse().unwrap(),
                    listening: false,
                    inode: 9,
                },
                process: "Browser".into(),
            }]))
        }
    }

    fn query(ip: &str) -> AttributionQuery {
        AttributionQuery {
            direction: Direction::Outbound,
            remote_ip: ip.parse().unwrap(),
            remote_port: Some(443),
            local_port: Some(50000),
            protocol: Protocol::Tcp,
        }
    }

    #[tokio::test]
    async fn test_unknown_before_first_refresh() {
        let attributor = ProcessAttributor::new(LocalAddrs::new());
        assert_eq!(attributor.attribute(&query("203.0.113.5")), UNKNOWN_APP);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let attributor = ProcessAttributor::new(LocalAddrs::new());
        let source = Arc::new(FixedSource {
            calls: AtomicUsize::new(0),
        });

        attributor.refresh_once(&source, false).await;
        assert_eq!(attributor.attribute(&query("203.0.113.5")), "Browser");
        assert_eq!(attributor.attribute(&query("8.8.8.8")), UNKNOWN_APP);

        attributor.refresh_once(&source, false).await;
        assert_eq!(attributor.attribute(&query("203.0.113.5")), "Browser");
        assert_eq!(attributor.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_discovers_local_addresses() {
        let attributor = ProcessAttributor::new(LocalAddrs::new());
        let source = Arc::new(FixedSource {
            calls: AtomicUsize::new(0),
        });
        attributor.refresh_once(&source, true).await;
        assert!(attributor
            .local_addrs()
            .contains(&"127.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_refresh_loop_stops_on_cancel() {
        let attributor = ProcessAttributor::new(LocalAddrs::new());
        let source = Arc::new(FixedSource {
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(attributor.clone().run_refresh_loop(
            source,
            Duration::from_millis(10),
            false,
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(attributor.socket_count(), 1);
    }
}
