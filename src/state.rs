//! Application state shared with HTTP handlers.

use prometheus::Registry;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::health_stats::HealthStats;
use crate::pipeline::Pipeline;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub pipeline: Pipeline,
    pub registry: Registry,
    pub config: Arc<Config>,
    pub health_stats: Arc<HealthStats>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(pipeline: Pipeline, registry: Registry) -> SharedState {
        Arc::new(Self {
            config: Arc::clone(&pipeline.config),
            health_stats: Arc::clone(&pipeline.health_stats),
            pipeline,
            registry,
            start_time: Instant::now(),
        })
    }
}
