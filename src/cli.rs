//! CLI arguments and subcommands for hostpulse.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "hostpulse",
    about = "Live host telemetry and network flow streamer",
    long_about = "Live host telemetry and network flow streamer.\n\n\
                  Samples CPU, memory, disk, network, thermal, energy, battery and latency \
                  on independent cadences, captures packet flows, attributes them to local \
                  processes, geolocates remote endpoints and streams one JSON snapshot per \
                  second over WebSocket.",
    version,
    propagate_version = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// HTTP listen port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bind to specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Log level (overrides log_level from the config file)
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Print only the loaded user config file + full path and exit
    #[arg(long)]
    pub show_user_config: bool,

    /// Output format for --show-config*
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Packet capture method: tcpdump or none
    #[arg(long)]
    pub capture_method: Option<String>,

    /// Capture interfaces (comma-separated; the first one is used)
    #[arg(short = 'i', long)]
    pub interfaces: Option<String>,

    /// Primary geolocation URL template (must contain {ip})
    #[arg(long)]
    pub geoip_api_url: Option<String>,

    /// Maximum flow records per snapshot
    #[arg(long)]
    pub max_flow_items: Option<usize>,

    /// Number of top processes by CPU to report
    #[arg(long)]
    pub top_processes: Option<usize>,

    /// Host pinged by the latency sampler
    #[arg(long)]
    pub latency_target: Option<String>,

    /// Disable /health endpoint
    #[arg(long)]
    pub disable_health: bool,

    /// Disable /metrics self-telemetry
    #[arg(long)]
    pub disable_telemetry: bool,

    /// Enable TLS/SSL for HTTPS
    #[arg(long)]
    pub enable_tls: bool,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check capture, attribution and sampler requirements
    Check {
        /// Also try to start the capture process briefly
        #[arg(long)]
        capture: bool,
    },

    /// Generate configuration files
    Config {
        /// Output file path ("-" for stdout)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments and examples
        #[arg(long)]
        commented: bool,
    },

    /// Run every sampler once and print a snapshot
    Test {
        /// Number of sampling rounds (rates need at least two)
        #[arg(short = 'n', long, default_value_t = 2)]
        iterations: usize,

        /// Also resolve this IP through the geolocation providers
        #[arg(long)]
        geo: Option<IpAddr>,

        /// Output format
        #[arg(long, value_enum, default_value = "json")]
        format: ConfigFormat,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_flags() {
        let args = Args::try_parse_from([
            "hostpulse",
            "--port",
            "9000",
            "--log-level",
            "debug",
            "-i",
            "eth0,wlan0",
            "--capture-method",
            "none",
        ])
        .unwrap();
        assert_eq!(args.port, Some(9000));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        assert_eq!(args.interfaces.as_deref(), Some("eth0,wlan0"));
        assert!(args.command.is_none());
    }

    #[test]
    fn test_parse_test_subcommand() {
        let args = Args::try_parse_from(["hostpulse", "test", "--geo", "203.0.113.5"]).unwrap();
        match args.command {
            Some(Commands::Test { iterations, geo, .. }) => {
                assert_eq!(iterations, 2);
                assert_eq!(geo, Some("203.0.113.5".parse().unwrap()));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
