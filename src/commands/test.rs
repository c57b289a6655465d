//! Test command implementation.
//!
//! Runs every sampler a few times and prints the last reading of each,
//! optionally resolving one IP through the geolocation providers.

use serde_json::{json, Map, Value};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::cli::ConfigFormat;
use crate::collectors::Sampler;
use crate::config::Config;
use crate::geo::{GeoResolver, GeoStatus, HttpGeoLookup};
use crate::scheduler::SamplerSet;

/// Pause between rounds so rate-based samplers have an interval to measure.
const ROUND_INTERVAL: Duration = Duration::from_secs(1);

async fn sample_into<S: Sampler>(sampler: &mut S, out: &mut Map<String, Value>) {
    let start = Instant::now();
    let value = match sampler.sample().await {
        Ok(reading) => serde_json::to_value(reading).unwrap_or(Value::Null),
        Err(e) => json!({ "error": e.to_string() }),
    };
    out.insert(
        sampler.name().to_string(),
        json!({ "duration_ms": start.elapsed().as_secs_f64() * 1000.0, "reading": value }),
    );
}

/// Tests metrics collection.
pub async fn command_test(
    iterations: usize,
    geo: Option<IpAddr>,
    format: ConfigFormat,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("🧪 hostpulse - Test Mode");
    println!("========================");

    let iterations = iterations.max(1);
    let mut set = SamplerSet::for_host(config);
    let mut results = Map::new();

    for iteration in 1..=iterations {
        println!("\n🔄 Iteration {}/{}", iteration, iterations);
        let start = Instant::now();
        sample_into(&mut set.cpu, &mut results).await;
        sample_into(&mut set.memory, &mut results).await;
        sample_into(&mut set.disk, &mut results).await;
        sample_into(&mut set.network, &mut results).await;
        sample_into(&mut set.latency, &mut results).await;
        sample_into(&mut set.thermal, &mut results).await;
        sample_into(&mut set.energy, &mut results).await;
        sample_into(&mut set.battery, &mut results).await;
        sample_into(&mut set.processes, &mut results).await;
        println!(
            "   ⏱️  Round duration: {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );
        if iteration < iterations {
            tokio::time::sleep(ROUND_INTERVAL).await;
        }
    }

    let failed = results
        .values()
        .filter(|v| v["reading"].get("error").is_some())
        .count();
    println!("   📊 Samplers: {} ok, {} failed", results.len() - failed, failed);

    if let Some(ip) = geo {
        println!("\n🌍 Resolving {}...", ip);
        let settings = config.geo_settings();
        let cancel = CancellationToken::new();
        let resolver = GeoResolver::start(HttpGeoLookup::new(&settings)?, &settings, cancel.clone());
        let value = match resolver.resolve_wait(ip).await {
            GeoStatus::Resolved(loc) => serde_json::to_value(loc)?,
            GeoStatus::NotApplicable => json!({ "error": "not a public address" }),
            GeoStatus::Failed | GeoStatus::Pending => json!({ "error": "lookup failed" }),
        };
        cancel.cancel();
        results.insert("geo".into(), value);
    }

    let doc = Value::Object(results);
    let rendered = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(&doc)?,
        ConfigFormat::Yaml => serde_yaml::to_string(&doc)?,
        ConfigFormat::Toml => toml::to_string_pretty(&doc)?,
    };
    println!("\n{}", rendered);

    println!("✅ Test completed");
    Ok(())
}
