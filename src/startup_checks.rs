//! Startup requirement validation for hostpulse.
//!
//! Nothing here is fatal: a host that cannot capture packets or read other
//! users' sockets still streams host metrics. Checks only log what will be
//! degraded so the operator can fix it.

use nix::unistd::geteuid;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::config::Config;

/// CAP_NET_RAW bit in the capability sets of /proc/<pid>/status.
const CAP_NET_RAW: u32 = 13;

/// Outcome of the requirement checks, also printed by `hostpulse check`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequirementReport {
    pub is_root: bool,
    pub has_net_raw: bool,
    pub procfs_readable: bool,
    pub capture_binary: Option<String>,
    pub ping_available: bool,
}

impl RequirementReport {
    /// True when packet capture can be expected to start.
    pub fn capture_ready(&self) -> bool {
        self.capture_binary.is_some() && (self.is_root || self.has_net_raw)
    }
}

/// Parses the effective capability mask from /proc/<pid>/status content.
pub fn effective_caps(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|l| l.strip_prefix("CapEff:"))
        .and_then(|v| u64::from_str_radix(v.trim(), 16).ok())
}

pub fn has_capability(caps: u64, cap: u32) -> bool {
    caps & (1u64 << cap) != 0
}

/// Collects requirement facts without logging.
pub fn probe_requirements(config: &Config, proc_root: &Path) -> RequirementReport {
    let caps = fs::read_to_string(proc_root.join("self/status"))
        .ok()
        .as_deref()
        .and_then(effective_caps)
        .unwrap_or(0);

    let binary = config.capture_binary.as_deref().unwrap_or("tcpdump");
    RequirementReport {
        is_root: geteuid().is_root(),
        has_net_raw: has_capability(caps, CAP_NET_RAW),
        procfs_readable: crate::pipeline::has_procfs(proc_root),
        capture_binary: which::which(binary)
            .ok()
            .map(|p| p.display().to_string()),
        ping_available: which::which("ping").is_ok(),
    }
}

/// Validate all runtime requirements and log what will be degraded.
pub fn validate_requirements(config: &Config) -> RequirementReport {
    info!("Validating runtime requirements...");
    let report = probe_requirements(config, Path::new("/proc"));

    if report.is_root {
        info!("Running as root (uid=0)");
    } else {
        warn!("Not running as root - connections of other users' processes will show as Unknown");
    }

    if !report.procfs_readable {
        warn!("/proc is not readable - host samplers and attribution will be unavailable");
    }

    if config.capture_enabled() {
        match &report.capture_binary {
            None => warn!(
                "Capture binary '{}' not found - network flows disabled",
                config.capture_binary.as_deref().unwrap_or("tcpdump")
            ),
            Some(path) if !report.capture_ready() => {
                warn!("{} found but CAP_NET_RAW is missing - capture will likely fail", path);
                warn!("   Solution: setcap cap_net_raw,cap_net_admin+eip {}", path);
            }
            Some(path) => info!("Capture binary: {}", path),
        }
    }

    if !report.ping_available {
        warn!("ping not found - latency will be reported as unavailable");
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_caps() {
        let status = "Name:\tcat\nCapInh:\t0000000000000000\nCapEff:\t0000000000002000\n";
        let caps = effective_caps(status).unwrap();
        assert!(has_capability(caps, CAP_NET_RAW));
        assert!(!has_capability(caps, 12));
    }

    #[test]
    fn test_missing_caps_line() {
        assert_eq!(effective_caps("Name:\tcat\n"), None);
    }

    #[test]
    fn test_capture_ready_requires_binary_and_privilege() {
        let mut report = RequirementReport {
            has_net_raw: true,
            ..Default::default()
        };
        assert!(!report.capture_ready());
        report.capture_binary = Some("/usr/sbin/tcpdump".into());
        assert!(report.capture_ready());
        report.has_net_raw = false;
        assert!(!report.capture_ready());
    }
}
