//! Check command implementation.
//!
//! Validates system requirements and configuration.

use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::capture::supervisor::spawn as spawn_capture;
use crate::capture::{resolve_interface, CaptureCommand};
use crate::config::{validate_effective_config, Config};
use crate::process::{collect_proc_entries, ConnectionSource, ProcConnectionSource};
use crate::startup_checks::probe_requirements;

/// How long `check --capture` lets the capture process run.
const CAPTURE_PROBE: Duration = Duration::from_secs(3);

/// Validates system requirements and configuration.
pub async fn command_check(capture: bool, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 hostpulse - System Check");
    println!("===========================");

    let mut all_ok = true;
    let proc_root = Path::new("/proc");
    let report = probe_requirements(config, proc_root);

    println!("\n📁 Checking /proc filesystem...");
    if report.procfs_readable {
        let entries = collect_proc_entries(proc_root);
        println!("   ✅ /proc accessible ({} processes)", entries.len());
        match ProcConnectionSource::new(proc_root).snapshot() {
            Ok(table) => println!("   ✅ Socket table readable ({} sockets)", table.len()),
            Err(e) => println!("   ⚠️  Socket table unreadable: {}", e),
        }
    } else {
        println!("   ❌ /proc filesystem not readable");
        all_ok = false;
    }

    println!("\n🔐 Checking privileges...");
    if report.is_root {
        println!("   ✅ Running as root");
    } else {
        println!("   ⚠️  Not root - other users' connections will be attributed to Unknown");
    }
    if report.has_net_raw {
        println!("   ✅ CAP_NET_RAW present");
    } else if !report.is_root {
        println!("   ⚠️  CAP_NET_RAW missing - packet capture will likely fail");
    }

    println!("\n📡 Checking packet capture...");
    if !config.capture_enabled() {
        println!("   ℹ️  Capture disabled by configuration");
    } else {
        match &report.capture_binary {
            Some(path) => println!("   ✅ Capture binary: {}", path),
            None => {
                println!(
                    "   ❌ Capture binary '{}' not found",
                    config.capture_binary.as_deref().unwrap_or("tcpdump")
                );
                all_ok = false;
            }
        }

        let configured = config.capture_interfaces.clone().unwrap_or_default();
        match resolve_interface(&configured, proc_root, Path::new("/sys")) {
            Ok(iface) => {
                println!("   ✅ Capture interface: {}", iface);
                if capture && report.capture_binary.is_some() {
                    all_ok &= probe_capture(config, &iface).await;
                }
            }
            Err(e) => {
                println!("   ❌ {}", e);
                all_ok = false;
            }
        }
    }

    println!("\n⏱️  Checking latency probe...");
    if report.ping_available {
        println!("   ✅ ping available");
    } else {
        println!("   ⚠️  ping not found - latency will be unavailable");
    }

    println!("\n⚙️  Checking configuration...");
    match validate_effective_config(config) {
        Ok(_) => println!("   ✅ Configuration is valid"),
        Err(e) => {
            println!("   ❌ Configuration invalid: {}", e);
            all_ok = false;
        }
    }

    println!("\n📋 Summary:");
    if all_ok {
        println!("   ✅ All checks passed - system is ready");
        Ok(())
    } else {
        println!("   ❌ Some checks failed - please review warnings");
        std::process::exit(1);
    }
}

/// Runs the capture process briefly and reports whether it produced output.
async fn probe_capture(config: &Config, iface: &str) -> bool {
    let binary = config.capture_binary.as_deref().unwrap_or("tcpdump");
    let cancel = CancellationToken::new();
    let (handle, mut lines) = spawn_capture(
        CaptureCommand::tcpdump(binary, iface),
        config.supervisor_settings(),
        cancel.clone(),
    );

    println!("   ⏳ Running capture for {}s...", CAPTURE_PROBE.as_secs());
    let mut received = 0usize;
    let _ = tokio::time::timeout(CAPTURE_PROBE, async {
        while lines.next_line().await.is_some() {
            received += 1;
        }
    })
    .await;
    cancel.cancel();

    match handle.last_error() {
        Some(err) if received == 0 => {
            println!("   ❌ Capture failed: {}", err);
            false
        }
        _ => {
            println!("   ✅ Capture produced {} lines", received);
            true
        }
    }
}
