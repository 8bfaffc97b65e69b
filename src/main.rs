use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peervision::config::ConfigStore;
use peervision::engine::InferenceEngine;
use peervision::events::EventBus;
use peervision::signaling::RoomRegistry;
use peervision::state::AppState;
use peervision::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// peervision command line arguments
#[derive(Parser, Debug)]
#[command(name = "peervision")]
#[command(version, about = "Real-time multi-object detection over WebRTC", long_about = None)]
struct CliArgs {
    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Path to the JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE", default_value = "peervision.json")]
    config: PathBuf,

    /// Path to the detector model (overrides config file)
    #[arg(short = 'm', long, value_name = "FILE")]
    model: Option<PathBuf>,

    /// Load the detector at startup instead of on first request
    #[arg(long)]
    eager_load: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Initialize logging with CLI arguments
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting peervision v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration (seed file + CLI overrides)
    let config_store = ConfigStore::load(&args.config).await?;
    config_store.update(|config| {
        if let Some(ref addr) = args.address {
            config.web.bind_address = addr.clone();
        }
        if let Some(port) = args.http_port {
            config.web.http_port = port;
        }
        if let Some(ref model) = args.model {
            config.detector.model_path = model.to_string_lossy().to_string();
        }
        if args.eager_load {
            config.detector.eager_load = true;
        }
    });
    let config = config_store.get();

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Create event bus for real-time notifications
    let events = Arc::new(EventBus::new());
    tracing::info!("Event bus initialized");

    // Create room registry (room state lives only in memory)
    let rooms = Arc::new(RoomRegistry::new());

    // Create inference engine and its dispatch worker
    let engine = InferenceEngine::new(
        config.detector.clone(),
        &config.engine,
        rooms.clone(),
        events.clone(),
    );
    tracing::info!(
        model = %config.detector.model_path,
        interval_ms = config.engine.min_frame_interval_ms,
        "Inference engine created"
    );

    // Eager model load when configured; lazy load happens on first frame
    if config.detector.eager_load {
        match engine.initialize().await {
            Ok(outcome) => tracing::info!(load_time_ms = outcome.load_time_ms, "Detector preloaded"),
            Err(e) => tracing::warn!("Detector preload failed, will retry lazily: {}", e),
        }
    }

    // Create application state
    let state = AppState::new(
        config_store.clone(),
        rooms,
        engine,
        events,
        shutdown_tx.clone(),
    );

    // Create router
    let app = web::create_router(state.clone());

    // Bind the listen socket
    let ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", config.web.bind_address))?;
    let addr = SocketAddr::new(ip, config.web.http_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    // Setup graceful shutdown
    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    // Build filter string based on effective level
    let filter = match effective_level {
        LogLevel::Error => "peervision=error,tower_http=error",
        LogLevel::Warn => "peervision=warn,tower_http=warn",
        LogLevel::Info => "peervision=info,tower_http=info",
        LogLevel::Verbose => "peervision=debug,tower_http=info",
        LogLevel::Debug => "peervision=debug,tower_http=debug",
        LogLevel::Trace => "peervision=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
