//! Latest snapshot as a one-off JSON document.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::time::Instant;
use tracing::{debug, instrument};

use crate::state::SharedState;

/// Handler for the /snapshot endpoint.
#[instrument(skip(state))]
pub async fn snapshot_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /snapshot request");
    let start = Instant::now();
    let response = match state.pipeline.publisher.latest() {
        Some(json) => (
            StatusCode::OK,
            [("Content-Type", "application/json")],
            json.to_string(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("Content-Type", "application/json")],
            r#"{"error":"no snapshot published yet"}"#.to_string(),
        ),
    };
    state.health_stats.record_http_request(start.elapsed());
    response
}
