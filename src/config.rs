//! Configuration management for hostpulse.
//!
//! Configuration is merged from CLI flags, environment variables, a config
//! file (YAML, JSON or TOML) and built-in defaults, in that order of
//! precedence.

use crate::cli::{Args, ConfigFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::capture::SupervisorSettings;
use crate::geo::GeoSettings;

// Default configuration constants
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_CAPTURE_METHOD: &str = "tcpdump";
pub const DEFAULT_GEOIP_API_URL: &str = "https://ipapi.co/{ip}/json/";
pub const DEFAULT_GEOIP_FALLBACK_URL: &str = "https://ipinfo.io/{ip}/json";
pub const DEFAULT_LATENCY_TARGET: &str = "8.8.8.8";

pub const CAPTURE_METHODS: &[&str] = &["tcpdump", "none"];

/// Per-family sampling cadences in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub cpu: u64,
    pub memory: u64,
    pub disk: u64,
    pub network: u64,
    pub processes: u64,
    pub energy: u64,
    pub thermal: u64,
    pub latency: u64,
    pub battery: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            cpu: 1,
            memory: 1,
            disk: 1,
            network: 1,
            processes: 2,
            energy: 5,
            thermal: 5,
            latency: 10,
            battery: 60,
        }
    }
}

impl CadenceConfig {
    fn entries(&self) -> [(&'static str, u64); 9] {
        [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("disk", self.disk),
            ("network", self.network),
            ("processes", self.processes),
            ("energy", self.energy),
            ("thermal", self.thermal),
            ("latency", self.latency),
            ("battery", self.battery),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    pub port: Option<u16>,
    pub bind: Option<String>,

    // Logging
    #[serde(alias = "log-level")]
    pub log_level: Option<String>,

    // Packet capture
    /// "tcpdump" | "none"
    #[serde(alias = "capture-method")]
    pub capture_method: Option<String>,
    #[serde(alias = "capture-interfaces", alias = "sniffer-interfaces")]
    pub capture_interfaces: Option<Vec<String>>,
    #[serde(alias = "capture-binary")]
    pub capture_binary: Option<String>,
    #[serde(alias = "capture-grace-ms")]
    pub capture_grace_ms: Option<u64>,
    #[serde(alias = "capture-backoff-base-ms")]
    pub capture_backoff_base_ms: Option<u64>,
    #[serde(alias = "capture-backoff-max-ms")]
    pub capture_backoff_max_ms: Option<u64>,
    #[serde(alias = "capture-max-start-failures")]
    pub capture_max_start_failures: Option<u32>,

    // Geolocation
    #[serde(alias = "geoip-api-url")]
    pub geoip_api_url: Option<String>,
    #[serde(alias = "geoip-fallback-urls")]
    pub geoip_fallback_urls: Option<Vec<String>>,
    #[serde(alias = "geoip-api-key")]
    pub geoip_api_key: Option<String>,
    #[serde(alias = "geoip-api-key-header")]
    pub geoip_api_key_header: Option<String>,
    #[serde(alias = "geoip-timeout-ms")]
    pub geoip_timeout_ms: Option<u64>,
    #[serde(alias = "geoip-negative-ttl-secs")]
    pub geoip_negative_ttl_secs: Option<u64>,
    #[serde(alias = "geoip-max-concurrent")]
    pub geoip_max_concurrent: Option<usize>,

    // Flows and attribution
    #[serde(alias = "attribution-refresh-secs")]
    pub attribution_refresh_secs: Option<u64>,
    #[serde(alias = "max-flow-items")]
    pub max_flow_items: Option<usize>,

    // Sustainability conversion factors
    #[serde(alias = "network-kwh-per-gb")]
    pub network_kwh_per_gb: Option<f64>,
    #[serde(alias = "co2-intensity-g-per-kwh")]
    pub co2_intensity_g_per_kwh: Option<f64>,

    // Samplers
    #[serde(alias = "latency-target")]
    pub latency_target: Option<String>,
    #[serde(alias = "top-processes")]
    pub top_processes: Option<usize>,
    #[serde(alias = "unavailable-retry-secs")]
    pub unavailable_retry_secs: Option<u64>,

    // Feature flags
    #[serde(alias = "enable-health")]
    pub enable_health: Option<bool>,
    #[serde(alias = "enable-telemetry")]
    pub enable_telemetry: Option<bool>,

    // TLS/SSL Configuration
    #[serde(alias = "enable-tls")]
    pub enable_tls: Option<bool>,
    #[serde(alias = "tls-cert-path")]
    pub tls_cert_path: Option<String>,
    #[serde(alias = "tls-key-path")]
    pub tls_key_path: Option<String>,

    // Nested tables last so TOML output stays valid
    #[serde(default)]
    pub cadences: CadenceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            port: Some(DEFAULT_PORT),
            log_level: Some("info".into()),
            capture_method: Some(DEFAULT_CAPTURE_METHOD.into()),
            capture_interfaces: None,
            capture_binary: Some("tcpdump".into()),
            capture_grace_ms: Some(2000),
            capture_backoff_base_ms: Some(1000),
            capture_backoff_max_ms: Some(30_000),
            capture_max_start_failures: Some(5),
            geoip_api_url: Some(DEFAULT_GEOIP_API_URL.into()),
            geoip_fallback_urls: Some(vec![DEFAULT_GEOIP_FALLBACK_URL.into()]),
            geoip_api_key: None,
            geoip_api_key_header: None,
            geoip_timeout_ms: Some(2500),
            geoip_negative_ttl_secs: Some(300),
            geoip_max_concurrent: Some(4),
            attribution_refresh_secs: Some(5),
            max_flow_items: Some(24),
            network_kwh_per_gb: Some(0.06),
            co2_intensity_g_per_kwh: Some(468.0),
            latency_target: Some(DEFAULT_LATENCY_TARGET.into()),
            top_processes: Some(5),
            cadences: CadenceConfig::default(),
            unavailable_retry_secs: Some(300),
            enable_health: Some(true),
            enable_telemetry: Some(true),
            enable_tls: Some(false),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Config {
    pub fn capture_enabled(&self) -> bool {
        self.capture_method.as_deref().unwrap_or(DEFAULT_CAPTURE_METHOD) != "none"
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let defaults = SupervisorSettings::default();
        SupervisorSettings {
            grace: self
                .capture_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.grace),
            backoff_base: self
                .capture_backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_max: self
                .capture_backoff_max_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            max_start_failures: self
                .capture_max_start_failures
                .unwrap_or(defaults.max_start_failures),
        }
    }

    pub fn geo_settings(&self) -> GeoSettings {
        let defaults = GeoSettings::default();
        GeoSettings {
            primary_url: self.geoip_api_url.clone().unwrap_or(defaults.primary_url),
            fallback_urls: self
                .geoip_fallback_urls
                .clone()
                .unwrap_or(defaults.fallback_urls),
            api_key: self.geoip_api_key.clone(),
            api_key_header: self.geoip_api_key_header.clone(),
            timeout: self
                .geoip_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            negative_ttl: self
                .geoip_negative_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.negative_ttl),
            max_concurrent: self
                .geoip_max_concurrent
                .unwrap_or(defaults.max_concurrent)
                .max(1),
        }
    }

    pub fn attribution_refresh(&self) -> Duration {
        Duration::from_secs(self.attribution_refresh_secs.unwrap_or(5).max(1))
    }

    pub fn unavailable_retry(&self) -> Duration {
        Duration::from_secs(self.unavailable_retry_secs.unwrap_or(300).max(1))
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(method) = cfg.capture_method.as_deref() {
        if !CAPTURE_METHODS.contains(&method) {
            return Err(format!(
                "Invalid capture_method '{}', expected one of: {}",
                method,
                CAPTURE_METHODS.join(", ")
            )
            .into());
        }
    }

    let templates = cfg
        .geoip_api_url
        .iter()
        .chain(cfg.geoip_fallback_urls.iter().flatten());
    for template in templates {
        if !template.contains("{ip}") {
            return Err(format!("Geolocation URL template '{}' has no {{ip}} placeholder", template).into());
        }
    }

    for (name, secs) in cfg.cadences.entries() {
        if secs == 0 {
            return Err(format!("Cadence for '{}' must be at least 1 second", name).into());
        }
    }

    for (name, value) in [
        ("network_kwh_per_gb", cfg.network_kwh_per_gb),
        ("co2_intensity_g_per_kwh", cfg.co2_intensity_g_per_kwh),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v <= 0.0 {
                return Err(format!("{} must be a positive number, got {}", name, v).into());
            }
        }
    }

    if cfg.max_flow_items == Some(0) {
        return Err("max_flow_items must be at least 1".into());
    }

    // TLS validation
    if cfg.enable_tls.unwrap_or(false) {
        let cert_path = cfg.tls_cert_path.as_deref();
        let key_path = cfg.tls_key_path.as_deref();

        match (cert_path, key_path) {
            (None, None) => {
                return Err(
                    "TLS is enabled but neither tls_cert_path nor tls_key_path are set".into(),
                );
            }
            (Some(_), None) => {
                return Err("TLS is enabled but tls_key_path is not set".into());
            }
            (None, Some(_)) => {
                return Err("TLS is enabled but tls_cert_path is not set".into());
            }
            (Some(cert), Some(key)) => {
                check_readable_file(cert, "TLS certificate")?;
                check_readable_file(key, "TLS private key")?;
            }
        }
    }

    Ok(())
}

fn check_readable_file(path: &str, what: &str) -> Result<(), Box<dyn std::error::Error>> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => Err(format!("{} file is empty: {}", what, path).into()),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(format!("{} file not found: {}", what, path).into())
        }
        Err(e) => Err(format!("{} file is not readable: {} ({})", what, path, e).into()),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Applies environment overrides using `lookup` to read variables.
pub fn apply_env_overrides_from<F>(config: &mut Config, lookup: F) -> Result<(), String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(method) = lookup("CAPTURE_METHOD") {
        config.capture_method = Some(method.trim().to_lowercase());
    }
    if let Some(ifaces) = lookup("CAPTURE_INTERFACES").or_else(|| lookup("SNIFFER_INTERFACES")) {
        let list = split_list(&ifaces);
        config.capture_interfaces = (!list.is_empty()).then_some(list);
    }
    if let Some(url) = lookup("GEOIP_API_URL") {
        config.geoip_api_url = Some(url.trim().to_string());
    }
    if let Some(key) = lookup("GEOIP_API_KEY") {
        let key = key.trim().to_string();
        config.geoip_api_key = (!key.is_empty()).then_some(key);
    }
    if let Some(urls) = lookup("GEOIP_FALLBACK_URLS") {
        config.geoip_fallback_urls = Some(split_list(&urls));
    }
    if let Some(v) = lookup("NETWORK_KWH_PER_GB") {
        let parsed = v
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("NETWORK_KWH_PER_GB: {e}"))?;
        config.network_kwh_per_gb = Some(parsed);
    }
    if let Some(v) = lookup("CO2_INTENSITY_G_PER_KWH") {
        let parsed = v
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("CO2_INTENSITY_G_PER_KWH: {e}"))?;
        config.co2_intensity_g_per_kwh = Some(parsed);
    }
    Ok(())
}

/// Resolves configuration from CLI args, environment, config file, and defaults.
/// This enforces precedence: CLI (if provided) > environment > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref().and_then(|p| p.to_str()))?
    };

    apply_env_overrides_from(&mut config, |key| std::env::var(key).ok())?;

    // Override with CLI args
    if let Some(bind_ip) = args.bind {
        config.bind = Some(bind_ip.to_string());
    }

    // Only override port if the user supplied it on the CLI.
    if let Some(cli_port) = args.port {
        config.port = Some(cli_port);
    }

    if let Some(method) = &args.capture_method {
        config.capture_method = Some(method.to_lowercase());
    }
    if let Some(ifaces) = &args.interfaces {
        config.capture_interfaces = Some(split_list(ifaces));
    }
    if let Some(url) = &args.geoip_api_url {
        config.geoip_api_url = Some(url.clone());
    }
    if let Some(n) = args.max_flow_items {
        config.max_flow_items = Some(n);
    }
    if let Some(n) = args.top_processes {
        config.top_processes = Some(n);
    }
    if let Some(target) = &args.latency_target {
        config.latency_target = Some(target.clone());
    }

    // Feature flags
    if args.disable_health {
        config.enable_health = Some(false);
    }
    if args.disable_telemetry {
        config.enable_telemetry = Some(false);
    }

    // TLS configuration: CLI wins if provided
    if args.enable_tls {
        config.enable_tls = Some(true);
    }
    if let Some(cert_path) = &args.tls_cert {
        config.tls_cert_path = Some(cert_path.to_string_lossy().to_string());
    }
    if let Some(key_path) = &args.tls_key {
        config.tls_key_path = Some(key_path.to_string_lossy().to_string());
    }

    Ok(config)
}

/// Finds the config file to load: the explicit path, else the first default
/// location that exists.
pub fn find_config_path(path: Option<&str>) -> Option<PathBuf> {
    if let Some(p) = path {
        return Some(PathBuf::from(p));
    }

    let defaults = [
        "/etc/hostpulse/hostpulse.yaml",
        "/etc/hostpulse/hostpulse.yml",
        "/etc/hostpulse/hostpulse.json",
        "/etc/hostpulse/hostpulse.toml",
        "./hostpulse.yaml",
        "./hostpulse.yml",
        "./hostpulse.json",
        "./hostpulse.toml",
    ];

    defaults
        .iter()
        .find(|p| Path::new(p).exists())
        .map(PathBuf::from)
}

/// Configuration loading with multiple format support. Missing files yield
/// the defaults.
pub fn load_config(path: Option<&str>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = match find_config_path(path) {
        Some(p) if p.exists() => p,
        _ => return Ok(Config::default()),
    };

    let content = fs::read_to_string(&path)?;

    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => {
            let config: Config = serde_json::from_str(&content)?;
            info!("Loaded JSON configuration from: {}", path.display());
            Ok(config)
        }
        Some("toml") => {
            let config: Config = toml::from_str(&content)?;
            info!("Loaded TOML configuration from: {}", path.display());
            Ok(config)
        }
        _ => {
            // Default to YAML
            let config: Config = serde_yaml::from_str(&content)?;
            info!("Loaded YAML configuration from: {}", path.display());
            Ok(config)
        }
    }
}

/// Renders configuration in the requested format.
pub fn render_config(config: &Config, format: &ConfigFormat) -> Result<String, Box<dyn std::error::Error>> {
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    })
}

/// Shows configuration in requested format
pub fn show_config(
    config: &Config,
    format: ConfigFormat,
    user_config: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = render_config(config, &format)?;

    if user_config {
        println!("User configuration (effective values):");
    }
    println!("{output}");
    Ok(())
}
