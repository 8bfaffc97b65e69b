//! Headless viewer peer
//!
//! Joins a room as the viewer, establishes the peer-to-peer session with
//! the capture peer, runs the bounded detection pipeline (locally or
//! offloaded to the server engine) and echoes results back over the
//! reverse channel. Telemetry events are printed as they are emitted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peervision::config::{AppConfig, DispatchMode};
use peervision::events::{EventBus, SystemEvent};
use peervision::viewer::{run_session, SessionCommand, ViewerSessionConfig};

fn parse_mode(value: &str) -> std::result::Result<DispatchMode, String> {
    value.parse()
}

/// Viewer command line arguments
#[derive(Parser, Debug)]
#[command(name = "viewer")]
#[command(version, about = "peervision headless viewer peer", long_about = None)]
struct ViewerArgs {
    /// Signaling endpoint URL
    #[arg(long, value_name = "URL", default_value = "ws://127.0.0.1:8080/ws")]
    server: String,

    /// Room identifier to join
    #[arg(long, value_name = "ID")]
    room: String,

    /// Inference dispatch mode (local or offload)
    #[arg(long, value_parser = parse_mode, default_value = "offload")]
    mode: DispatchMode,

    /// Path to the detector model (local mode)
    #[arg(long, value_name = "FILE")]
    model: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "viewer=info,peervision=info",
        1 => "viewer=debug,peervision=debug",
        _ => "viewer=trace,peervision=trace",
    };
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ViewerArgs::parse();
    init_logging(args.verbose);

    let mut app_config = AppConfig::default();
    app_config.viewer.server_url = args.server;
    app_config.viewer.room = args.room;
    app_config.viewer.mode = args.mode;
    if let Some(model) = args.model {
        app_config.detector.model_path = model.to_string_lossy().to_string();
    }

    let config = ViewerSessionConfig::from_app_config(&app_config);
    let events = Arc::new(EventBus::new());

    // Print telemetry and state transitions as the UI collaborator would
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event {
                SystemEvent::ViewerStateChanged { state, room } => {
                    tracing::info!(room = %room, state = %state, "State changed");
                }
                SystemEvent::TelemetryUpdated {
                    e2e,
                    server_latency_ms,
                    network_latency_ms,
                    processed_fps,
                    bandwidth,
                    ..
                } => {
                    tracing::info!(
                        e2e_median_ms = e2e.median_ms,
                        e2e_p95_ms = e2e.p95_ms,
                        server_ms = server_latency_ms,
                        network_ms = network_latency_ms,
                        fps = processed_fps,
                        uplink_kbps = bandwidth.uplink_kbps,
                        downlink_kbps = bandwidth.downlink_kbps,
                        "Telemetry"
                    );
                }
                SystemEvent::DetectionProduced {
                    frame_id, count, ..
                } => {
                    tracing::debug!(frame = %frame_id, count, "Detections");
                }
                SystemEvent::SystemError { module, message } => {
                    tracing::warn!(module = %module, "{}", message);
                }
                SystemEvent::ModelStateChanged { .. } => {}
            }
        }
    });

    let (control_tx, control_rx) = mpsc::unbounded_channel();

    // Ctrl-C closes the session cleanly
    let shutdown_tx = control_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(SessionCommand::Shutdown);
        }
    });

    let summary = run_session(config, events, control_rx).await?;
    tracing::info!(
        frames = summary.total_frames,
        with_detections = summary.frames_with_detections,
        e2e_median_ms = summary.e2e.median_ms,
        "Session closed"
    );

    Ok(())
}
