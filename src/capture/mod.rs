//! Packet capture: a supervised external capture process and its line parser.

use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::CaptureError;

pub mod parse;
pub mod supervisor;

pub use supervisor::{CaptureHandle, CaptureLines, SupervisorSettings};

/// Lifecycle of the supervised capture process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    #[default]
    Stopped,
    Starting,
    Running,
    Backoff,
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CaptureState::Stopped => "stopped",
            CaptureState::Starting => "starting",
            CaptureState::Running => "running",
            CaptureState::Backoff => "backoff",
        };
        f.write_str(s)
    }
}

/// Program and arguments of the capture process.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl CaptureCommand {
    /// `tcpdump -nn -l -q -tt -i <iface> "ip or ip6"`: numeric, line
    /// buffered, quiet, epoch timestamps.
    pub fn tcpdump(binary: &str, interface: &str) -> Self {
        Self {
            program: binary.to_string(),
            args: ["-nn", "-l", "-q", "-tt", "-i", interface, "ip or ip6"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl std::fmt::Display for CaptureCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Interface carrying the IPv4 default route, from `<proc_root>/net/route`.
pub fn default_route_interface(proc_root: &Path) -> Option<String> {
    let content = fs::read_to_string(proc_root.join("net/route")).ok()?;
    content.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        let destination = fields.next()?;
        (destination == "00000000").then(|| iface.to_string())
    })
}

/// First non-loopback interface whose operstate is `up`.
pub fn first_up_interface(sys_root: &Path) -> Option<String> {
    let mut names: Vec<String> = fs::read_dir(sys_root.join("class/net"))
        .ok()?
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .filter(|name| name != "lo")
        .collect();
    names.sort();
    names.into_iter().find(|name| {
        fs::read_to_string(sys_root.join("class/net").join(name).join("operstate"))
            .map(|s| s.trim() == "up")
            .unwrap_or(false)
    })
}

/// Picks the capture interface: the first configured one, else the
/// default-route interface, else the first up interface.
pub fn resolve_interface(
    configured: &[String],
    proc_root: &Path,
    sys_root: &Path,
) -> Result<String, CaptureError> {
    if let Some(first) = configured.iter().find(|s| !s.trim().is_empty()) {
        if configured.len() > 1 {
            debug!("Multiple capture interfaces configured, using {}", first);
        }
        return Ok(first.trim().to_string());
    }
    default_route_interface(proc_root)
        .or_else(|| first_up_interface(sys_root))
        .ok_or(CaptureError::NoInterface)
}
