//! Error types shared by the sampling, capture and geolocation subsystems.
//!
//! None of these errors ever terminate the publish loop. Each subsystem
//! recovers locally and surfaces the failure through its status fields.

use std::time::Duration;

/// Failure of a single sampler read.
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    /// The data source does not exist on this host (missing binary, sensor
    /// or privilege). The scheduler backs off to the slow retry cadence.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),
}

impl SamplerError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, SamplerError::Unavailable(_))
    }
}

/// Failure to bring up packet capture.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture binary '{0}' not found")]
    BinaryNotFound(String),

    #[error("failed to spawn capture process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("no capture interface available")]
    NoInterface,

    #[error("capture disabled by configuration")]
    Disabled,
}

impl CaptureError {
    /// Short machine-friendly code used in `capture_status.sniffer_error`.
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::BinaryNotFound(_) => "capture-binary-not-installed",
            CaptureError::Spawn(_) => "capture-start-failed",
            CaptureError::NoInterface => "capture-no-interface",
            CaptureError::Disabled => "capture-disabled",
        }
    }
}

/// Failure of one geolocation attempt.
#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned status {0}")]
    Status(u16),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("invalid URL template '{0}'")]
    Template(String),

    #[error("all {attempts} providers failed")]
    AllProvidersFailed { attempts: usize },
}
