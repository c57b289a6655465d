//! hostpulse - live host telemetry and network flow streamer.
//!
//! Entry point: resolves configuration, handles subcommands, then runs the
//! sampling pipeline behind an HTTP/WebSocket server until a shutdown signal.

use axum::{routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use prometheus::Registry;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};

use hostpulse::cli::{Args, Commands, LogLevel};
use hostpulse::commands::{command_check, command_config, command_test};
use hostpulse::config::{
    resolve_config, show_config, validate_effective_config, Config, DEFAULT_BIND_ADDR, DEFAULT_PORT,
};
use hostpulse::handlers::{
    health_handler, metrics_handler, root_handler, snapshot_handler, ws_handler,
};
use hostpulse::pipeline::Pipeline;
use hostpulse::startup_checks;
use hostpulse::state::AppState;

/// Initializes tracing. The CLI level wins over `log_level` from the config.
fn setup_logging(config: &Config, args: &Args) {
    let level = match &args.log_level {
        Some(LogLevel::Off) => LevelFilter::OFF,
        Some(LogLevel::Error) => LevelFilter::ERROR,
        Some(LogLevel::Warn) => LevelFilter::WARN,
        Some(LogLevel::Info) => LevelFilter::INFO,
        Some(LogLevel::Debug) => LevelFilter::DEBUG,
        Some(LogLevel::Trace) => LevelFilter::TRACE,
        None => config
            .log_level
            .as_deref()
            .and_then(|l| LevelFilter::from_str(l).ok())
            .unwrap_or(LevelFilter::INFO),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Logging initialized with level: {}", level);
}

/// Resolves configuration and exits with code 1 if it is invalid.
fn load_validated_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }
    Ok(config)
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.show_user_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        return show_config(&config, args.config_format.clone(), args.show_user_config);
    }

    if let Some(command) = &args.command {
        if let Commands::Config {
            output,
            format,
            commented,
        } = command
        {
            return command_config(output.clone(), format.clone(), *commented);
        }

        let config = load_validated_config(&args)?;
        setup_logging(&config, &args);

        return match command {
            Commands::Check { capture } => command_check(*capture, &config).await,
            Commands::Test {
                iterations,
                geo,
                format,
            } => command_test(*iterations, *geo, format.clone(), &config).await,
            Commands::Config { .. } => unreachable!("Config handled above"),
        };
    }

    let config = load_validated_config(&args)?;
    setup_logging(&config, &args);

    info!("Starting hostpulse {}", env!("CARGO_PKG_VERSION"));
    startup_checks::validate_requirements(&config);

    let bind_ip_str = config.bind.clone().unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
    let port = config.port.unwrap_or(DEFAULT_PORT);
    let enable_health = config.enable_health.unwrap_or(true);
    let enable_telemetry = config.enable_telemetry.unwrap_or(true);
    let enable_tls = config.enable_tls.unwrap_or(false);
    let tls_paths = (config.tls_cert_path.clone(), config.tls_key_path.clone());

    let registry = Registry::new();
    let cancel = CancellationToken::new();
    let (pipeline, tasks) = Pipeline::start(
        Arc::new(config),
        enable_telemetry.then_some(&registry),
        cancel.clone(),
    )
    .await
    .map_err(|e| {
        error!("Failed to start pipeline: {}", e);
        e
    })?;

    let state = AppState::new(pipeline, registry);

    let addr: SocketAddr = format!("{}:{}", bind_ip_str, port).parse()?;

    let mut app = Router::new()
        .route("/", get(root_handler))
        .route("/ws", get(ws_handler))
        .route("/snapshot", get(snapshot_handler));

    if enable_health {
        app = app.route("/health", get(health_handler));
    }
    if enable_telemetry {
        app = app.route("/metrics", get(metrics_handler));
    }

    let app = app.with_state(state);

    let result: Result<(), Box<dyn std::error::Error>> = if enable_tls {
        let (Some(cert_path), Some(key_path)) = tls_paths else {
            // validate_effective_config rejects this combination
            return Err("enable_tls requires tls_cert_path and tls_key_path".into());
        };

        info!("Loading TLS certificate from: {}", cert_path);
        info!("Loading TLS private key from: {}", key_path);

        let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
            .await
            .map_err(|e| {
                error!("Failed to load TLS configuration: {}", e);
                e
            })?;

        info!("hostpulse listening on https://{}:{}", bind_ip_str, port);
        let server = axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service());

        tokio::select! {
            result = server => result.map_err(Into::into),
            _ = shutdown_signal() => Ok(()),
        }
    } else {
        let listener = TcpListener::bind(addr).await?;
        info!("hostpulse listening on http://{}:{}", bind_ip_str, port);

        let server = axum::serve(listener, app);

        tokio::select! {
            result = server => result.map_err(Into::into),
            _ = shutdown_signal() => Ok(()),
        }
    };

    if let Err(e) = &result {
        error!("Server error: {}", e);
    }

    cancel.cancel();
    info!("Stopping pipeline...");
    tasks.join().await;
    if result.is_ok() {
        info!("hostpulse stopped gracefully");
    } else {
        warn!("hostpulse stopped after a server error");
    }
    result
}
