//! hostpulse: live host telemetry and network flow streaming.
//!
//! The crate samples host metric families (CPU, memory, disk, network,
//! latency, thermal, energy, battery, processes) on independent cadences,
//! supervises an external packet-capture process, aggregates the captured
//! packets into per-remote-endpoint flows attributed to local processes and
//! geolocated, and publishes one combined snapshot per second to any number
//! of stream clients.
//!
//! # Usage
//!
//! ```no_run
//! use hostpulse::config::Config;
//! use hostpulse::pipeline::Pipeline;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let cancel = CancellationToken::new();
//! let (pipeline, tasks) = Pipeline::start(Arc::new(Config::default()), None, cancel.clone()).await?;
//!
//! let mut sub = pipeline.publisher.subscribe();
//! if let Ok(json) = sub.rx.recv().await {
//!     println!("{json}");
//! }
//!
//! cancel.cancel();
//! tasks.join().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod cli;
pub mod collectors;
pub mod commands;
pub mod config;
pub mod error;
pub mod flow;
pub mod geo;
pub mod handlers;
pub mod health_stats;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod publisher;
pub mod scheduler;
pub mod snapshot;
pub mod startup_checks;
pub mod state;
pub mod sustainability;
