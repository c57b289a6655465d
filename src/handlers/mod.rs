//! HTTP endpoint handlers.
//!
//! - `/`: landing page
//! - `/ws`: live snapshot stream (WebSocket)
//! - `/snapshot`: latest snapshot as JSON
//! - `/health`: pipeline health (text)
//! - `/metrics`: Prometheus self-telemetry

pub mod health;
pub mod metrics;
pub mod root;
pub mod snapshot;
pub mod ws;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use root::root_handler;
pub use snapshot::snapshot_handler;
pub use ws::ws_handler;
