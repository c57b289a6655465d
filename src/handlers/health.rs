//! Health check endpoint handler.
//!
//! Returns pipeline statistics, capture status and per-sampler state as a
//! plain-text table.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::time::Instant;
use tracing::{debug, instrument};

use crate::snapshot::ReadingStatus;
use crate::state::SharedState;

// Time conversion constants
const SECONDS_PER_HOUR: f64 = 3600.0;
const MINUTES_PER_HOUR: f64 = 60.0;
const HOURS_PER_DAY: f64 = 24.0;

/// Footer text for human-readable HTTP endpoints.
pub const FOOTER_TEXT: &str = concat!("hostpulse ", env!("CARGO_PKG_VERSION"));

/// Handler for the /health endpoint.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");
    let start = Instant::now();

    let samplers = state.pipeline.table.health();
    let capture = state.pipeline.capture_status();
    let published = state.pipeline.publisher.latest().is_some();

    // 503 until the first snapshot exists or when every sampler has failed
    let all_failed = samplers
        .iter()
        .all(|s| matches!(s.status, ReadingStatus::Failed | ReadingStatus::Unavailable));
    let (status, message) = if !published {
        (StatusCode::SERVICE_UNAVAILABLE, "Starting - no snapshot published yet")
    } else if all_failed {
        (StatusCode::SERVICE_UNAVAILABLE, "No sampler is producing data")
    } else if samplers.iter().any(|s| s.status != ReadingStatus::Ok) {
        (StatusCode::OK, "OK - degraded")
    } else {
        (StatusCode::OK, "OK")
    };

    let uptime_seconds = state.health_stats.get_uptime_seconds();
    let uptime_hours = uptime_seconds as f64 / SECONDS_PER_HOUR;
    let uptime_str = if uptime_hours < 1.0 {
        format!("{:.1} minutes", uptime_hours * MINUTES_PER_HOUR)
    } else if uptime_hours < HOURS_PER_DAY {
        format!("{:.1} hours", uptime_hours)
    } else {
        format!("{:.1} days", uptime_hours / HOURS_PER_DAY)
    };

    let table = state.health_stats.render_table(&samplers, &capture);
    state.health_stats.record_http_request(start.elapsed());

    debug!("Health check: {} - {}", status, message);
    (
        status,
        [("Content-Type", "text/plain; charset=utf-8")],
        format!(
            "{message}\n\nUptime: {uptime_str}\nStream clients: {}\n\n{table}\n{FOOTER_TEXT}\n",
            state.pipeline.publisher.client_count()
        ),
    )
}
