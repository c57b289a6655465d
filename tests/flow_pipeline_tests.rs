//! End-to-end tests for capture lines flowing through aggregation,
//! attribution and geolocation into flow records.

use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use hostpulse::capture::supervisor::spawn as spawn_capture;
use hostpulse::capture::{CaptureCommand, CaptureState, SupervisorSettings};
use hostpulse::error::GeoError;
use hostpulse::flow::{Direction, FlowAggregator, LocalAddrs, Protocol};
use hostpulse::geo::{GeoLocation, GeoLookup, GeoResolver, GeoSettings};
use hostpulse::process::connections::{OwnedSocket, SocketEntry};
use hostpulse::process::{ConnectionTable, ProcessAttributor, UNKNOWN_APP};

const LOCAL: &str = "192.168.1.10";

/// A provider that never answers, so unresolved IPs stay pending.
struct NeverResolves;

impl GeoLookup for NeverResolves {
    async fn lookup(&self, _ip: IpAddr) -> Result<GeoLocation, GeoError> {
        std::future::pending().await
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn browser_socket() -> OwnedSocket {
    OwnedSocket {
        socket: SocketEntry {
            protocol: Protocol::Tcp,
            local: format!("{LOCAL}:50000").parse().unwrap(),
            remote: "203.0.113.5:443".parse().unwrap(),
            listening: false,
            inode: 4242,
        },
        process: "Browser".into(),
    }
}

fn aggregator(cancel: &CancellationToken) -> (FlowAggregator, GeoResolver) {
    let local = LocalAddrs::from_addrs([ip(LOCAL)]);
    let attributor = ProcessAttributor::new(local.clone());
    attributor.replace_table(ConnectionTable::new(vec![browser_socket()]));
    let geo = GeoResolver::start(NeverResolves, &GeoSettings::default(), cancel.clone());
    (FlowAggregator::new(local, attributor, geo.clone(), 24), geo)
}

#[tokio::test]
async fn test_interval_yields_attributed_geolocated_records() {
    let cancel = CancellationToken::new();
    let (agg, geo) = aggregator(&cancel);
    geo.insert(
        ip("203.0.113.5"),
        GeoLocation {
            lat: 40.7,
            lon: -74.0,
            country: Some("United States".into()),
            country_code: Some("US".into()),
            city: Some("New York".into()),
        },
    );

    for line in [
        "1700000000.000001 IP 192.168.1.10.50000 > 203.0.113.5.443: tcp 1500",
        "1700000000.000002 IP 192.168.1.10.50000 > 203.0.113.5.443: tcp 500",
        "1700000000.000003 IP 198.51.100.9.53211 > 192.168.1.10.8080: tcp 1000",
    ] {
        agg.ingest_line(line);
    }

    let records = agg.flush_with_elapsed(Duration::from_secs(1));
    assert_eq!(records.len(), 2);

    let out = &records[0];
    assert_eq!(out.direction, Direction::Outbound);
    assert_eq!(out.remote_ip, ip("203.0.113.5"));
    assert_eq!(out.bytes, 2000);
    assert!((out.mb_s - 0.0019).abs() < 1e-4, "mb_s = {}", out.mb_s);
    assert_eq!(out.app, "Browser");
    assert_eq!(out.lat, Some(40.7));
    assert_eq!(out.lon, Some(-74.0));
    assert_eq!(out.country_code.as_deref(), Some("US"));

    let inb = &records[1];
    assert_eq!(inb.direction, Direction::Inbound);
    assert_eq!(inb.remote_ip, ip("198.51.100.9"));
    assert_eq!(inb.bytes, 1000);
    assert!((inb.mb_s - 0.00095).abs() < 1e-4, "mb_s = {}", inb.mb_s);
    assert_eq!(inb.app, UNKNOWN_APP);
    assert_eq!(inb.lat, None);
    assert_eq!(inb.lon, None);

    let json = serde_json::to_value(&records).unwrap();
    assert_eq!(json[1]["lat"], serde_json::Value::Null);
    assert_eq!(json[0]["direction"], "outbound");

    assert!(agg.flush_with_elapsed(Duration::from_secs(1)).is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn test_capture_restart_keeps_feeding_flows() {
    let cancel = CancellationToken::new();
    let (agg, _geo) = aggregator(&cancel);

    let command = CaptureCommand {
        program: "sh".into(),
        args: vec![
            "-c".into(),
            "echo '1.0 IP 192.168.1.10.50000 > 203.0.113.5.443: tcp 100'; sleep 0.2; exit 0".into(),
        ],
    };
    let settings = SupervisorSettings {
        grace: Duration::from_millis(50),
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(100),
        max_start_failures: 3,
    };
    let (handle, lines) = spawn_capture(command, settings, cancel.clone());
    let ingest = tokio::spawn(agg.clone().run_ingest(lines, cancel.clone()));

    let mut states = handle.watch_state();
    let mut seen = Vec::new();
    let collect = async {
        // running, then not running after exit, then running again
        while seen.iter().filter(|s| **s == CaptureState::Running).count() < 2 {
            if states.changed().await.is_err() {
                break;
            }
            seen.push(*states.borrow());
        }
    };
    tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("capture restarted within one backoff cycle");

    let first_running = seen.iter().position(|s| *s == CaptureState::Running).unwrap();
    assert!(seen[first_running..]
        .iter()
        .any(|s| *s != CaptureState::Running));
    assert!(handle.restarts() >= 1);

    // Both runs' lines reach the aggregator
    tokio::time::timeout(Duration::from_secs(2), async {
        while agg.stats().local_match < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("lines from both runs ingested");

    let records = agg.flush();
    assert_eq!(records.len(), 1);
    assert!(records[0].bytes >= 200);
    assert_eq!(records[0].app, "Browser");

    cancel.cancel();
    ingest.await.unwrap();
}
