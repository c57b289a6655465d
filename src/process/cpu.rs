//! CPU time parsing for per-process utilisation.
//!
//! Parses `/proc/<pid>/stat` and keeps the previous CPU time per PID so
//! percentages are computed from deltas between scans.

use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use std::fs;
use std::path::Path;
use std::sync::RwLock as StdRwLock;
use std::time::Instant;
use tracing::debug;

/// Get system clock ticks per second (usually 100, but can vary).
fn get_clk_tck() -> f64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf is safe to call with _SC_CLK_TCK
        // Returns -1 on error, 0 if undefined - both are handled by the > 0 check
        unsafe {
            let tck = libc::sysconf(libc::_SC_CLK_TCK);
            if tck > 0 {
                return tck as f64;
            }
        }
    }
    100.0
}

/// System clock ticks per second (for CPU time calculation).
pub static CLK_TCK: Lazy<f64> = Lazy::new(get_clk_tck);

/// The fields of `/proc/<pid>/stat` we care about, in clock ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcStat {
    pub utime: u64,
    pub stime: u64,
    pub starttime: u64,
}

impl ProcStat {
    pub fn cpu_time_seconds(&self) -> f64 {
        (self.utime + self.stime) as f64 / *CLK_TCK
    }

    pub fn start_seconds(&self) -> f64 {
        self.starttime as f64 / *CLK_TCK
    }
}

/// Parses a stat line. The command name may contain spaces and parentheses,
/// so fields are counted from the last `)`.
pub fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let close = content.rfind(')')?;
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // rest[0] is the state (field 3); utime is field 14
    if rest.len() < 20 {
        return None;
    }
    Some(ProcStat {
        utime: rest[11].parse().ok()?,
        stime: rest[12].parse().ok()?,
        starttime: rest[19].parse().ok()?,
    })
}

pub fn read_proc_stat(proc_path: &Path) -> Result<ProcStat, std::io::Error> {
    let content = fs::read_to_string(proc_path.join("stat"))?;
    parse_proc_stat(&content).ok_or_else(|| std::io::Error::other("Invalid stat format"))
}

/// Reads system uptime in seconds from `<proc_root>/uptime`.
pub fn read_uptime(proc_root: &Path) -> Result<f64, std::io::Error> {
    let content = fs::read_to_string(proc_root.join("uptime"))?;
    content
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| std::io::Error::other("Invalid uptime format"))
}

struct CpuEntry {
    cpu_time_seconds: f64,
    last_updated: Instant,
}

/// Remembers each PID's CPU time between scans.
#[derive(Default)]
pub struct CpuTracker {
    entries: StdRwLock<HashMap<u32, CpuEntry>>,
}

impl CpuTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// CPU percent for `pid` since the previous call. A PID seen for the
    /// first time reports its average since process start.
    pub fn cpu_percent(&self, pid: u32, stat: &ProcStat, uptime: Option<f64>) -> f64 {
        let now = Instant::now();
        let cpu_time = stat.cpu_time_seconds();

        let previous = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
            .map(|e| (e.cpu_time_seconds, e.last_updated));

        let percent = match previous {
            Some((prev_time, at)) => {
                let dt = now.duration_since(at).as_secs_f64();
                if dt > 0.0 && cpu_time > prev_time {
                    (cpu_time - prev_time) / dt * 100.0
                } else {
                    0.0
                }
            }
            None => match uptime {
                Some(up) => {
                    let lifetime = up - stat.start_seconds();
                    if lifetime > 0.0 {
                        cpu_time / lifetime * 100.0
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            },
        };

        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                pid,
                CpuEntry {
                    cpu_time_seconds: cpu_time,
                    last_updated: now,
                },
            );

        percent
    }

    /// Drops entries for PIDs not in `alive`.
    pub fn retain(&self, alive: &ahash::AHashSet<u32>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|pid, _| alive.contains(pid));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Pruned {} exited processes from CPU tracker", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
