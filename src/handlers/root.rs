//! Root endpoint handler for the landing page.

use axum::{
    extract::State,
    response::{Html, IntoResponse},
};
use std::time::Instant;
use tracing::{debug, instrument};

use crate::handlers::health::FOOTER_TEXT;
use crate::state::SharedState;

/// Handler for the root `/` endpoint.
#[instrument(skip(state))]
pub async fn root_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing / request");
    let start = Instant::now();

    let version = env!("CARGO_PKG_VERSION");
    let built = env!("VERGEN_BUILD_TIMESTAMP");

    let uptime_secs = state.start_time.elapsed().as_secs();
    let uptime_str = format!(
        "{}h {}m {}s",
        uptime_secs / 3600,
        (uptime_secs % 3600) / 60,
        uptime_secs % 60
    );
    let capture = state.pipeline.capture_status();
    let capture_str = if capture.sniffer_running {
        format!("running on {}", capture.ifaces.join(", "))
    } else {
        capture
            .sniffer_error
            .unwrap_or_else(|| "stopped".to_string())
    };

    let mut endpoints = String::from(
        r#"        <li><a href="/snapshot">/snapshot</a><div class="endpoint-desc">Latest snapshot (JSON)</div></li>
        <li><code>/ws</code><div class="endpoint-desc">WebSocket stream, one snapshot per second</div></li>
"#,
    );
    if state.config.enable_health.unwrap_or(true) {
        endpoints.push_str(
            r#"        <li><a href="/health">/health</a><div class="endpoint-desc">Pipeline health & sampler status (text)</div></li>
"#,
        );
    }
    if state.config.enable_telemetry.unwrap_or(true) {
        endpoints.push_str(
            r#"        <li><a href="/metrics">/metrics</a><div class="endpoint-desc">Prometheus self-telemetry</div></li>
"#,
        );
    }

    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>hostpulse</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; margin: 0; padding: 20px; background: #f5f5f5; line-height: 1.6; }}
        .container {{ max-width: 900px; margin: 0 auto; background: white; padding: 40px; border-radius: 8px; box-shadow: 0 2px 8px rgba(0,0,0,0.1); }}
        h1 {{ color: #333; border-bottom: 3px solid #007bff; padding-bottom: 15px; }}
        .info {{ background: #e9ecef; padding: 15px; border-radius: 4px; display: flex; justify-content: space-around; flex-wrap: wrap; }}
        .info-label {{ font-weight: 600; color: #555; display: block; font-size: 0.9em; }}
        .info-value {{ font-size: 1.1em; color: #007bff; }}
        .endpoint-list {{ list-style: none; padding: 0; }}
        .endpoint-list li {{ margin: 15px 0; padding: 15px; background: #f8f9fa; border-left: 4px solid #007bff; border-radius: 4px; }}
        .endpoint-desc {{ color: #666; margin-top: 5px; }}
        .footer {{ margin-top: 40px; padding-top: 20px; border-top: 1px solid #ddd; color: #666; font-size: 0.9em; text-align: center; }}
    </style>
</head>
<body>
<div class="container">
    <h1>hostpulse</h1>
    <p>Live host telemetry and network flow streamer</p>

    <div class="info">
        <div><span class="info-label">Version</span><span class="info-value">{version}</span></div>
        <div><span class="info-label">Built</span><span class="info-value">{built}</span></div>
        <div><span class="info-label">Uptime</span><span class="info-value">{uptime}</span></div>
        <div><span class="info-label">Capture</span><span class="info-value">{capture}</span></div>
        <div><span class="info-label">Stream clients</span><span class="info-value">{clients}</span></div>
    </div>

    <h2>Available Endpoints</h2>
    <ul class="endpoint-list">
{endpoints}    </ul>

    <div class="footer"><p>{footer}</p></div>
</div>
</body>
</html>"#,
        version = version,
        built = built,
        uptime = uptime_str,
        capture = capture_str,
        clients = state.pipeline.publisher.client_count(),
        endpoints = endpoints,
        footer = FOOTER_TEXT
    );

    state.health_stats.record_http_request(start.elapsed());
    Html(html)
}
