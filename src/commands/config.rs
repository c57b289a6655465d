//! Config command implementation.
//!
//! Generates configuration files in various formats.

use std::fs;
use std::path::PathBuf;

use crate::cli::ConfigFormat;
use crate::config::{render_config, Config};

/// Generates configuration files.
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let output = output.unwrap_or_else(|| PathBuf::from("hostpulse.yaml"));

    let mut content = render_config(&config, &format)?;
    if commented && matches!(format, ConfigFormat::Yaml) {
        content = add_config_comments(content);
    }

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)?;
        println!("✅ Configuration written to: {}", output.display());
    }

    Ok(())
}

/// Adds comments to YAML configuration.
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# hostpulse Configuration
# =======================
#
# Server
# ------
# bind: "127.0.0.1"            # Bind IP (0.0.0.0 = all interfaces)
# port: 8000                   # HTTP port (/ws, /snapshot, /health, /metrics)
# log_level: "info"            # off, error, warn, info, debug, trace
#
# Packet Capture
# --------------
# capture_method: "tcpdump"    # "tcpdump" or "none"
# capture_interfaces: null     # e.g. ["eth0"]; only the first is used
# capture_binary: "tcpdump"    # Capture program looked up on PATH
# capture_grace_ms: 2000       # Wait before SIGKILL on stop
# capture_backoff_base_ms: 1000
# capture_backoff_max_ms: 30000
# capture_max_start_failures: 5 # Consecutive failed starts before giving up
#
# Geolocation
# -----------
# geoip_api_url: "https://ipapi.co/{ip}/json/"
# geoip_fallback_urls: ["https://ipinfo.io/{ip}/json"]
# geoip_api_key: null          # Substituted for {key}, or sent in a header
# geoip_api_key_header: null   # Header name for the API key
# geoip_timeout_ms: 2500
# geoip_negative_ttl_secs: 300 # Cooldown after a failed lookup
# geoip_max_concurrent: 4
#
# Flows and Attribution
# ---------------------
# attribution_refresh_secs: 5  # Socket table refresh period
# max_flow_items: 24           # Flow records per snapshot
#
# Sustainability
# --------------
# network_kwh_per_gb: 0.06
# co2_intensity_g_per_kwh: 468.0
#
# Samplers
# --------
# latency_target: "8.8.8.8"    # Host pinged by the latency sampler
# top_processes: 5             # Processes reported by CPU usage
# unavailable_retry_secs: 300  # Retry period for unavailable sources
# cadences:                    # Seconds between reads per family
#   cpu: 1
#   memory: 1
#   disk: 1
#   network: 1
#   processes: 2
#   energy: 5
#   thermal: 5
#   latency: 10
#   battery: 60
#
# Feature Flags
# -------------
# enable_health: true          # Enable /health endpoint
# enable_telemetry: true       # Enable /metrics self-telemetry
#
# TLS/SSL Configuration
# ---------------------
# enable_tls: false
# tls_cert_path: null          # PEM certificate
# tls_key_path: null           # PEM private key
"#;

    format!("{comments}\n{yaml}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_written_config_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hostpulse.yaml");
        command_config(Some(path.clone()), ConfigFormat::Yaml, true).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# hostpulse Configuration"));
        let parsed: Config = serde_yaml::from_str(&content).unwrap();
        assert_eq!(parsed.port, Some(8000));
        assert_eq!(parsed.cadences.battery, 60);
    }
}
