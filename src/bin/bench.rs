//! Benchmark harness
//!
//! Drives the detection pipeline with synthetic frames for a fixed
//! duration and writes the collected telemetry as a JSON record. Local
//! mode exercises the in-process detector path; offload mode joins a room
//! as the viewer and round-trips frames through the live broker and
//! engine. Exit codes: 0 on success, 1 on precondition or runtime
//! failure, 130/143 on interrupt/terminate (with a partial-results file
//! when any samples were collected).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use image::{Rgb, RgbImage};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peervision::config::DispatchMode;
use peervision::engine::detector::Detector;
use peervision::engine::postprocess::{postprocess, PostprocessParams};
use peervision::engine::preprocess;
use peervision::error::{AppError, Result};
use peervision::events::LatencySnapshot;
use peervision::signaling::message::{
    ClientMessage, DetectionResult, FrameRequest, PeerRole, ServerMessage,
};
use peervision::utils::now_ms;
use peervision::viewer::signaling_client::{SignalingClient, SignalingSender};
use peervision::viewer::telemetry::{TelemetrySummary, ViewerTelemetry};

/// Detector input edge used for synthetic frames
const INPUT_SIZE: u32 = 640;
/// JPEG quality of synthetic frames
const JPEG_QUALITY: u8 = 70;
/// Offload round-trip timeout
const OFFLOAD_TIMEOUT: Duration = Duration::from_millis(200);
/// How long to wait for the server-side model to initialize
const MODEL_INIT_TIMEOUT: Duration = Duration::from_secs(60);

fn parse_mode(value: &str) -> std::result::Result<DispatchMode, String> {
    value.parse()
}

/// Benchmark harness command line arguments
#[derive(Parser, Debug)]
#[command(name = "bench")]
#[command(version, about = "peervision benchmark harness", long_about = None)]
struct BenchArgs {
    /// Benchmark duration in seconds (minimum 5)
    #[arg(long, value_name = "SECONDS")]
    duration: u64,

    /// Inference dispatch mode (local or offload)
    #[arg(long, value_parser = parse_mode)]
    mode: DispatchMode,

    /// Output path for the benchmark record
    #[arg(long, value_name = "PATH")]
    output: PathBuf,

    /// Server base URL
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Room identifier (generated when omitted)
    #[arg(long, value_name = "ID")]
    room: Option<String>,

    /// Path to the detector model (local mode)
    #[arg(long, value_name = "FILE", default_value = "models/yolov5n.onnx")]
    model: PathBuf,

    /// Synthetic frame rate
    #[arg(long, value_name = "FPS", default_value_t = 8)]
    fps: u32,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// ============================================================================
// Persisted benchmark record
// ============================================================================

#[derive(Serialize)]
struct BenchmarkSection {
    timestamp: String,
    mode: String,
    duration_seconds: f64,
    total_frames: u64,
    frames_with_detections: u64,
    detection_rate_percent: f64,
}

#[derive(Serialize)]
struct PerformanceSection {
    processed_fps: f64,
    e2e_latency: LatencySnapshot,
    server_latency: LatencySnapshot,
    network_latency: LatencySnapshot,
}

#[derive(Serialize)]
struct BandwidthSection {
    uplink_kbps: f64,
    downlink_kbps: f64,
    total_bytes_sent: u64,
    total_bytes_received: u64,
}

#[derive(Serialize)]
struct BenchmarkReport {
    benchmark: BenchmarkSection,
    performance: PerformanceSection,
    bandwidth: BandwidthSection,
}

impl BenchmarkReport {
    fn from_summary(summary: &TelemetrySummary, mode: DispatchMode) -> Self {
        Self {
            benchmark: BenchmarkSection {
                timestamp: chrono::Utc::now().to_rfc3339(),
                mode: mode.to_string(),
                duration_seconds: summary.duration_seconds,
                total_frames: summary.total_frames,
                frames_with_detections: summary.frames_with_detections,
                detection_rate_percent: summary.detection_rate_percent(),
            },
            performance: PerformanceSection {
                processed_fps: summary.processed_fps,
                e2e_latency: summary.e2e.clone(),
                server_latency: summary.server.clone(),
                network_latency: summary.network.clone(),
            },
            bandwidth: BandwidthSection {
                uplink_kbps: summary.bandwidth.uplink_kbps,
                downlink_kbps: summary.bandwidth.downlink_kbps,
                total_bytes_sent: summary.total_bytes_sent,
                total_bytes_received: summary.total_bytes_received,
            },
        }
    }
}

/// Path for partial results: `results.json` -> `results_partial.json`
fn partial_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "benchmark".to_string());
    let name = match output.extension() {
        Some(ext) => format!("{}_partial.{}", stem, ext.to_string_lossy()),
        None => format!("{}_partial", stem),
    };
    output.with_file_name(name)
}

fn write_report(path: &Path, summary: &TelemetrySummary, mode: DispatchMode) -> Result<()> {
    let report = BenchmarkReport::from_summary(summary, mode);
    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(path, json)?;
    Ok(())
}

// ============================================================================
// Synthetic frames
// ============================================================================

/// Deterministic test pattern: a gradient background with a block that
/// moves with the sequence number, so consecutive frames differ
fn synthetic_frame(seq: u64, size: u32) -> RgbImage {
    let block = size / 8;
    let offset = ((seq * 13) % (size - block) as u64) as u32;

    RgbImage::from_fn(size, size, move |x, y| {
        if x >= offset && x < offset + block && y >= offset && y < offset + block {
            Rgb([240, 240, 240])
        } else {
            Rgb([(x * 255 / size) as u8, (y * 255 / size) as u8, 64])
        }
    })
}

async fn encode_synthetic_frame(seq: u64) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let image = synthetic_frame(seq, INPUT_SIZE);
        let jpeg = preprocess::encode_jpeg(&image, JPEG_QUALITY)?;
        Ok(preprocess::to_data_uri(&jpeg))
    })
    .await
    .map_err(|e| AppError::Internal(format!("encode task failed: {}", e)))?
}

// ============================================================================
// Runner
// ============================================================================

enum Backend {
    Local {
        detector: Arc<Detector>,
    },
    Offload {
        signaling: SignalingSender,
        events: mpsc::UnboundedReceiver<ServerMessage>,
        room: String,
    },
}

struct BenchRunner {
    backend: Backend,
    telemetry: ViewerTelemetry,
    bytes_sent: u64,
    bytes_received: u64,
    seq: u64,
}

impl BenchRunner {
    async fn new(args: &BenchArgs, room: String) -> Result<Self> {
        let backend = match args.mode {
            DispatchMode::Local => {
                let path = args.model.clone();
                let detector =
                    tokio::task::spawn_blocking(move || Detector::load(&path, INPUT_SIZE))
                        .await
                        .map_err(|e| AppError::Internal(format!("load task failed: {}", e)))??;
                Backend::Local {
                    detector: Arc::new(detector),
                }
            }
            DispatchMode::Offload => {
                let ws_url = ws_url(&args.server);
                let client = SignalingClient::connect(&ws_url).await?;
                let (signaling, mut events) = client.split();

                signaling.send(ClientMessage::JoinRoom {
                    room: room.clone(),
                    role: PeerRole::Viewer,
                })?;

                wait_for_model(&signaling, &mut events, &room).await?;

                Backend::Offload {
                    signaling,
                    events,
                    room,
                }
            }
        };

        Ok(Self {
            backend,
            telemetry: ViewerTelemetry::new(100, 10, now_ms()),
            bytes_sent: 0,
            bytes_received: 0,
            seq: 0,
        })
    }

    async fn run(&mut self, duration: Duration, fps: u32) -> Result<()> {
        let deadline = Instant::now() + duration;
        let frame_interval = Duration::from_millis(1000 / fps.max(1) as u64);
        let mut frame_tick = tokio::time::interval(frame_interval);
        frame_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_stats = Instant::now();

        while Instant::now() < deadline {
            frame_tick.tick().await;
            self.step().await?;

            if last_stats.elapsed() >= Duration::from_secs(1) {
                self.record_stats();
                last_stats = Instant::now();
            }
        }
        self.record_stats();
        Ok(())
    }

    async fn step(&mut self) -> Result<()> {
        let seq = self.seq;
        self.seq += 1;
        let frame_id = format!("bench-{}", seq);
        let capture_ts = now_ms();
        let image_data = encode_synthetic_frame(seq).await?;

        let (result, local_mode) = match &mut self.backend {
            Backend::Local { detector } => {
                let detector = detector.clone();
                let recv_ts = now_ms();
                let data = image_data;
                let detections = tokio::task::spawn_blocking(move || {
                    let tensor = preprocess::prepare(&data, INPUT_SIZE)?;
                    let candidates = detector.infer(&tensor)?;
                    Ok::<_, AppError>(postprocess(&candidates, &PostprocessParams::default()))
                })
                .await
                .map_err(|e| AppError::Internal(format!("inference task failed: {}", e)))??;

                (
                    DetectionResult {
                        frame_id,
                        capture_ts,
                        recv_ts,
                        inference_ts: now_ms(),
                        detections,
                    },
                    true,
                )
            }

            Backend::Offload {
                signaling,
                events,
                room,
            } => {
                let request = ClientMessage::ProcessFrame(FrameRequest {
                    room: room.clone(),
                    frame_id: frame_id.clone(),
                    capture_ts,
                    width: INPUT_SIZE,
                    height: INPUT_SIZE,
                    image_data,
                });
                self.bytes_sent += serde_json::to_string(&request)
                    .map(|s| s.len() as u64)
                    .unwrap_or(0);
                signaling.send(request)?;

                let result = await_result(events, &frame_id, capture_ts, &mut self.bytes_received)
                    .await?;
                (result, false)
            }
        };

        let latencies = self.telemetry.on_result(&result, now_ms(), local_mode);
        debug!(
            frame = %result.frame_id,
            detections = result.detections.len(),
            e2e_ms = latencies.e2e_ms,
            "Frame processed"
        );
        Ok(())
    }

    fn record_stats(&mut self) {
        self.telemetry
            .record_transport(now_ms(), self.bytes_sent, self.bytes_received);
    }

    fn summary(&self) -> TelemetrySummary {
        self.telemetry.summary(now_ms())
    }
}

/// Await the matching detection result, synthesizing an empty one on
/// timeout (late replies are discarded by the frame-id check)
async fn await_result(
    events: &mut mpsc::UnboundedReceiver<ServerMessage>,
    frame_id: &str,
    capture_ts: u64,
    bytes_received: &mut u64,
) -> Result<DetectionResult> {
    let deadline = Instant::now() + OFFLOAD_TIMEOUT;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(DetectionResult::empty(frame_id, capture_ts, now_ms()));
        }

        match timeout(remaining, events.recv()).await {
            Ok(Some(ServerMessage::DetectionResult(result))) => {
                *bytes_received += serde_json::to_string(&result)
                    .map(|s| s.len() as u64)
                    .unwrap_or(0);
                if result.frame_id == frame_id {
                    return Ok(result);
                }
                debug!(frame = %result.frame_id, "Late result discarded");
            }
            Ok(Some(ServerMessage::ProcessingError { error })) => {
                warn!(error = %error, "Engine reported processing error");
                return Ok(DetectionResult::empty(frame_id, capture_ts, now_ms()));
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(AppError::Signaling("control connection closed".to_string()));
            }
            Err(_) => {
                return Ok(DetectionResult::empty(frame_id, capture_ts, now_ms()));
            }
        }
    }
}

/// Ask the broker to load the detector and wait for the outcome
async fn wait_for_model(
    signaling: &SignalingSender,
    events: &mut mpsc::UnboundedReceiver<ServerMessage>,
    room: &str,
) -> Result<()> {
    signaling.send(ClientMessage::InitializeServerModel {
        room: room.to_string(),
    })?;

    let deadline = Instant::now() + MODEL_INIT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AppError::ModelNotLoaded(
                "server model initialization timed out".to_string(),
            ));
        }

        match timeout(remaining, events.recv()).await {
            Ok(Some(ServerMessage::ModelInitializationResult {
                success,
                load_time,
                error,
                ..
            })) => {
                return if success {
                    info!(load_time_ms = ?load_time, "Server model ready");
                    Ok(())
                } else {
                    Err(AppError::ModelLoad(
                        error.unwrap_or_else(|| "unknown".to_string()),
                    ))
                };
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(AppError::Signaling("control connection closed".to_string()));
            }
            Err(_) => {
                return Err(AppError::ModelNotLoaded(
                    "server model initialization timed out".to_string(),
                ));
            }
        }
    }
}

/// Derive the signaling endpoint from the HTTP base URL
fn ws_url(server: &str) -> String {
    let base = server.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base)
    };
    format!("{}/ws", ws)
}

/// Liveness precondition against the HTTP side channel
async fn probe_health(server: &str) -> bool {
    let url = format!("{}/health", server.trim_end_matches('/'));
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };
    match client.get(&url).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "bench=info,peervision=warn",
        1 => "bench=debug,peervision=debug",
        _ => "bench=trace,peervision=trace",
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

enum Outcome {
    Completed,
    Failed,
    Interrupted,
    Terminated,
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let args = BenchArgs::parse();
    init_logging(args.verbose);

    if args.duration < 5 {
        eprintln!("error: --duration must be at least 5 seconds");
        return 1;
    }

    if !probe_health(&args.server).await {
        eprintln!("error: server unreachable at {}", args.server);
        return 1;
    }

    let room = args.room.clone().unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().to_string();
        format!("bench-{}", &id[..8])
    });
    info!(room = %room, mode = %args.mode, duration = args.duration, "Benchmark starting");

    let mut runner = match BenchRunner::new(&args, room).await {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(e) => {
            eprintln!("error: failed to install SIGTERM handler: {}", e);
            return 1;
        }
    };

    let duration = Duration::from_secs(args.duration);
    let outcome = tokio::select! {
        result = runner.run(duration, args.fps) => match result {
            Ok(()) => Outcome::Completed,
            Err(e) => {
                eprintln!("error: {}", e);
                Outcome::Failed
            }
        },
        _ = tokio::signal::ctrl_c() => Outcome::Interrupted,
        _ = sigterm.recv() => Outcome::Terminated,
    };

    let summary = runner.summary();

    match outcome {
        Outcome::Completed => match write_report(&args.output, &summary, args.mode) {
            Ok(()) => {
                info!(
                    path = %args.output.display(),
                    frames = summary.total_frames,
                    "Benchmark complete"
                );
                0
            }
            Err(e) => {
                eprintln!("error: failed to write report: {}", e);
                1
            }
        },
        Outcome::Failed => {
            write_partial(&args.output, &summary, args.mode);
            1
        }
        Outcome::Interrupted => {
            write_partial(&args.output, &summary, args.mode);
            130
        }
        Outcome::Terminated => {
            write_partial(&args.output, &summary, args.mode);
            143
        }
    }
}

/// Write the partial-results file when any samples were collected
fn write_partial(output: &Path, summary: &TelemetrySummary, mode: DispatchMode) {
    if summary.total_frames == 0 {
        return;
    }
    let path = partial_path(output);
    match write_report(&path, summary, mode) {
        Ok(()) => info!(path = %path.display(), "Partial results written"),
        Err(e) => eprintln!("error: failed to write partial results: {}", e),
    }
}
