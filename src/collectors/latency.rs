//! Network latency sampler that shells out to `ping -c 3 -q <target>`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::Sampler;
use crate::error::SamplerError;

const PING_COUNT: u32 = 3;
const PING_TIMEOUT: Duration = Duration::from_secs(8);

static RTT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:rtt|round-trip)[^=]*=\s*([\d.]+)/([\d.]+)/([\d.]+)(?:/([\d.]+))?\s*ms")
        .expect("valid rtt regex")
});
static LOSS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\d.]+)% packet loss").expect("valid loss regex"));

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencyReading {
    pub target: String,
    pub avg_ms: f64,
    /// mdev as reported by ping; absent on BSD-style output without it.
    pub jitter_ms: Option<f64>,
    pub packet_loss_percent: Option<f64>,
}

/// Extracts `(avg, jitter, loss)` from ping's quiet summary.
pub fn parse_ping_summary(output: &str) -> Option<(f64, Option<f64>, Option<f64>)> {
    let caps = RTT_RE.captures(output)?;
    let avg: f64 = caps.get(2)?.as_str().parse().ok()?;
    let jitter = caps.get(4).and_then(|m| m.as_str().parse().ok());
    let loss = LOSS_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    Some((avg, jitter, loss))
}

pub struct LatencySampler {
    program: String,
    target: String,
}

impl LatencySampler {
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_program("ping", target)
    }

    pub fn with_program(program: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            target: target.into(),
        }
    }
}

impl Sampler for LatencySampler {
    type Output = LatencyReading;

    fn name(&self) -> &'static str {
        "latency"
    }

    async fn sample(&mut self) -> Result<LatencyReading, SamplerError> {
        if which::which(&self.program).is_err() {
            return Err(SamplerError::Unavailable(format!(
                "'{}' not found in PATH",
                self.program
            )));
        }

        let child = Command::new(&self.program)
            .args(["-c", &PING_COUNT.to_string(), "-q", &self.target])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(PING_TIMEOUT, child)
            .await
            .map_err(|_| SamplerError::Timeout(PING_TIMEOUT))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            if stderr.contains("not permitted") || stderr.contains("Permission denied") {
                return Err(SamplerError::Unavailable(stderr.trim().to_string()));
            }
            return Err(SamplerError::Command {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let (avg_ms, jitter_ms, packet_loss_percent) = parse_ping_summary(&stdout)
            .ok_or_else(|| SamplerError::Parse("no rtt summary in ping output".into()))?;
        debug!("ping {}: avg={}ms", self.target, avg_ms);

        Ok(LatencyReading {
            target: self.target.clone(),
            avg_ms,
            jitter_ms,
            packet_loss_percent,
        })
    }
}
