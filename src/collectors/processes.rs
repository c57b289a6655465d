//! Top processes by CPU usage.
//!
//! Scans every `/proc/<pid>` in parallel with rayon and keeps the `top_n`
//! busiest entries. The scan runs on the blocking pool so a read timeout
//! can abandon it.

use ahash::AHashSet;
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::Sampler;
use crate::error::SamplerError;
use crate::process::cpu::{read_proc_stat, read_uptime, CpuTracker};
use crate::process::scanner::{collect_proc_entries, read_process_name};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessesReading {
    pub top: Vec<ProcessInfo>,
}

pub struct ProcessesSampler {
    proc_root: PathBuf,
    top_n: usize,
    tracker: Arc<CpuTracker>,
}

impl ProcessesSampler {
    pub fn new(proc_root: impl Into<PathBuf>, top_n: usize) -> Self {
        Self {
            proc_root: proc_root.into(),
            top_n,
            tracker: Arc::new(CpuTracker::new()),
        }
    }
}

fn scan(
    proc_root: &Path,
    top_n: usize,
    tracker: &CpuTracker,
) -> Result<ProcessesReading, SamplerError> {
    if !proc_root.is_dir() {
        return Err(SamplerError::Unavailable(format!(
            "{} not present",
            proc_root.display()
        )));
    }

    let entries = collect_proc_entries(proc_root);
    let uptime = read_uptime(proc_root).ok();

    // Processes may exit mid-scan; those are skipped silently
    let mut infos: Vec<ProcessInfo> = entries
        .par_iter()
        .filter_map(|entry| {
            let stat = read_proc_stat(&entry.proc_path).ok()?;
            let name = read_process_name(&entry.proc_path)?;
            let cpu_percent = tracker.cpu_percent(entry.pid, &stat, uptime);
            Some(ProcessInfo {
                pid: entry.pid,
                name,
                cpu_percent,
            })
        })
        .collect();

    let alive: AHashSet<u32> = entries.iter().map(|e| e.pid).collect();
    tracker.retain(&alive);

    debug!("Scanned {} processes", infos.len());

    infos.sort_by(|a, b| {
        b.cpu_percent
            .partial_cmp(&a.cpu_percent)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.pid.cmp(&b.pid))
    });
    infos.truncate(top_n);

    Ok(ProcessesReading { top: infos })
}

impl Sampler for ProcessesSampler {
    type Output = ProcessesReading;

    fn name(&self) -> &'static str {
        "processes"
    }

    async fn sample(&mut self) -> Result<ProcessesReading, SamplerError> {
        let proc_root = self.proc_root.clone();
        let top_n = self.top_n;
        let tracker = Arc::clone(&self.tracker);
        tokio::task::spawn_blocking(move || scan(&proc_root, top_n, &tracker))
            .await
            .map_err(|e| {
                SamplerError::Io(std::io::Error::other(format!(
                    "process scan task failed: {e}"
                )))
            })?
    }
}
