//! Metrics endpoint handler for Prometheus scraping.
//!
//! Exposes the pipeline's own telemetry. The snapshot gauges are refreshed
//! on every publish tick, so a scrape only encodes the registry.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use prometheus::{Encoder, TextEncoder};
use std::time::Instant;
use tracing::{debug, error, instrument};

use crate::state::SharedState;

/// Buffer capacity for metrics encoding.
const BUFFER_CAP: usize = 16 * 1024;

/// Error type for metrics endpoint failures.
#[derive(Debug)]
pub enum MetricsError {
    EncodingFailed,
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
    }
}

/// Handler for the /metrics endpoint.
#[instrument(skip(state))]
pub async fn metrics_handler(State(state): State<SharedState>) -> Result<String, MetricsError> {
    let start = Instant::now();
    debug!("Processing /metrics request");

    let families = state.registry.gather();
    let mut buffer = Vec::with_capacity(BUFFER_CAP);
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        error!("Failed to encode Prometheus metrics");
        return Err(MetricsError::EncodingFailed);
    }

    state.health_stats.record_http_request(start.elapsed());
    debug!(
        "Metrics request completed: {} families, {} bytes",
        families.len(),
        buffer.len()
    );

    String::from_utf8(buffer).map_err(|_| MetricsError::EncodingFailed)
}
