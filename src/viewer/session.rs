//! Viewer session orchestration
//!
//! Owns the viewer-side peer-to-peer session for one room and the bounded
//! inference pipeline behind it. All state lives in one task: the loop
//! selects over signaling events, peer connection events, dispatch
//! completions, the stats tick and external control, and every transition
//! goes through the state machine. Inference itself runs in spawned tasks
//! that report back over a channel, so the loop never blocks on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::machine::{Command, StateMachine, ViewerEvent, ViewerState};
use super::peer::{ConnectionState, PeerEvent, ViewerPeer};
use super::pipeline::LatestFrameSlot;
use super::signaling_client::{SignalingClient, SignalingSender};
use super::telemetry::{TelemetrySummary, ViewerTelemetry};
use crate::config::{AppConfig, DispatchMode};
use crate::engine::detector::Detector;
use crate::engine::postprocess::{postprocess, PostprocessParams};
use crate::engine::preprocess;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::signaling::message::{
    ClientMessage, Detection, DetectionResult, FrameRequest, PeerRole, ServerMessage,
};
use crate::utils::now_ms;

/// External control for a running session
#[derive(Debug, Clone, Copy)]
pub enum SessionCommand {
    /// Start or stop consuming frames
    ToggleDetection(bool),
    /// Close the session and release everything
    Shutdown,
}

/// Per-session configuration, flattened from the application config
#[derive(Debug, Clone)]
pub struct ViewerSessionConfig {
    pub server_url: String,
    pub room: String,
    pub mode: DispatchMode,
    pub offload_timeout: Duration,
    pub offload_jpeg_quality: u8,
    pub stun_servers: Vec<String>,
    pub model_path: String,
    pub input_size: u32,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub latency_window: usize,
    pub bandwidth_window: usize,
    pub stats_interval: Duration,
    /// Toggle detection on as soon as the transport is established
    pub auto_start_detection: bool,
}

impl ViewerSessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            server_url: config.viewer.server_url.clone(),
            room: config.viewer.room.clone(),
            mode: config.viewer.mode,
            offload_timeout: Duration::from_millis(config.viewer.offload_timeout_ms),
            offload_jpeg_quality: config.viewer.offload_jpeg_quality,
            stun_servers: config.viewer.stun_servers.clone(),
            model_path: config.detector.model_path.clone(),
            input_size: config.detector.input_size,
            score_threshold: config.detector.score_threshold,
            iou_threshold: config.detector.iou_threshold,
            latency_window: config.telemetry.latency_window,
            bandwidth_window: config.telemetry.bandwidth_window,
            stats_interval: Duration::from_millis(config.telemetry.stats_interval_ms),
            auto_start_detection: true,
        }
    }

    fn postprocess_params(&self) -> PostprocessParams {
        PostprocessParams {
            input_size: self.input_size as f32,
            score_threshold: self.score_threshold,
            iou_threshold: self.iou_threshold,
        }
    }
}

/// Transport byte counters shared with dispatch tasks
#[derive(Default)]
struct TransportCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

/// Correlation slot for the single in-flight offload request
struct PendingOffload {
    frame_id: String,
    reply: oneshot::Sender<DetectionResult>,
}

/// A completed dispatch reported back to the session loop
struct DispatchOutcome {
    result: DetectionResult,
}

struct Session {
    config: ViewerSessionConfig,
    machine: StateMachine,
    slot: LatestFrameSlot<FrameRequest>,
    telemetry: ViewerTelemetry,
    events: Arc<EventBus>,
    signaling: SignalingSender,
    peer: Option<Arc<ViewerPeer>>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    pending_candidates: Vec<Value>,
    pending_offload: Option<PendingOffload>,
    latest_answer: Option<Value>,
    detector: Option<Arc<Detector>>,
    counters: Arc<TransportCounters>,
    done_tx: mpsc::UnboundedSender<DispatchOutcome>,
}

/// Run one viewer session to completion
///
/// Returns the telemetry summary once the session closes (shutdown
/// command, control channel loss, or broker disconnect).
pub async fn run_session(
    config: ViewerSessionConfig,
    events: Arc<EventBus>,
    mut control_rx: mpsc::UnboundedReceiver<SessionCommand>,
) -> Result<TelemetrySummary> {
    // Local mode needs the in-process detector before any frame arrives
    let detector = match config.mode {
        DispatchMode::Local => {
            let path = std::path::PathBuf::from(&config.model_path);
            let input_size = config.input_size;
            let detector = tokio::task::spawn_blocking(move || Detector::load(&path, input_size))
                .await
                .map_err(|e| AppError::Internal(format!("detector load task failed: {}", e)))??;
            Some(Arc::new(detector))
        }
        DispatchMode::Offload => None,
    };

    let client = SignalingClient::connect(&config.server_url).await?;
    let (signaling, mut server_rx) = client.split();

    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let mut session = Session {
        telemetry: ViewerTelemetry::new(config.latency_window, config.bandwidth_window, now_ms()),
        slot: LatestFrameSlot::new(),
        machine: StateMachine::new(),
        config,
        events,
        signaling,
        peer: None,
        peer_tx,
        pending_candidates: Vec::new(),
        pending_offload: None,
        latest_answer: None,
        detector,
        counters: Arc::new(TransportCounters::default()),
        done_tx,
    };

    let mut stats_tick = tokio::time::interval(session.config.stats_interval);
    stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    session.drive(ViewerEvent::ControlOpened).await;

    while session.machine.state() != ViewerState::Closed {
        tokio::select! {
            message = server_rx.recv() => {
                match message {
                    Some(message) => session.handle_server_message(message).await,
                    None => {
                        info!("Control connection lost, closing session");
                        session.drive(ViewerEvent::Shutdown).await;
                    }
                }
            }

            event = peer_rx.recv() => {
                if let Some(event) = event {
                    session.handle_peer_event(event).await;
                }
            }

            outcome = done_rx.recv() => {
                if let Some(outcome) = outcome {
                    session.handle_outcome(outcome).await;
                }
            }

            command = control_rx.recv() => {
                match command {
                    Some(SessionCommand::ToggleDetection(on)) => {
                        session.drive(ViewerEvent::DetectionToggled(on)).await;
                    }
                    Some(SessionCommand::Shutdown) | None => {
                        session.drive(ViewerEvent::Shutdown).await;
                    }
                }
            }

            _ = stats_tick.tick() => {
                session.record_transport_stats();
            }
        }
    }

    Ok(session.telemetry.summary(now_ms()))
}

impl Session {
    /// Feed one event through the state machine and execute the commands
    async fn drive(&mut self, event: ViewerEvent) {
        let mut queue = vec![event];
        while let Some(event) = queue.pop() {
            let before = self.machine.state();
            let commands = self.machine.apply(event);
            let after = self.machine.state();

            if after != before {
                self.events.publish(SystemEvent::ViewerStateChanged {
                    state: after.to_string(),
                    room: self.config.room.clone(),
                });
            }

            for command in commands {
                if let Some(follow_up) = self.exec(command).await {
                    queue.push(follow_up);
                }
            }
        }
    }

    /// Execute one state machine command, possibly producing a follow-up
    /// event
    async fn exec(&mut self, command: Command) -> Option<ViewerEvent> {
        match command {
            Command::SendJoin => {
                let join = ClientMessage::JoinRoom {
                    room: self.config.room.clone(),
                    role: PeerRole::Viewer,
                };
                match self.signaling.send(join) {
                    Ok(()) => Some(ViewerEvent::JoinAcked),
                    Err(e) => {
                        warn!(error = %e, "Failed to join room");
                        Some(ViewerEvent::Shutdown)
                    }
                }
            }

            Command::CreateOffer => match self.create_peer_and_offer().await {
                Ok(()) => Some(ViewerEvent::OfferSent),
                Err(e) => {
                    warn!(error = %e, "Failed to create offer");
                    self.events.publish(SystemEvent::SystemError {
                        module: "viewer".to_string(),
                        message: e.to_string(),
                    });
                    None
                }
            },

            Command::ApplyAnswer => {
                if let Err(e) = self.apply_answer().await {
                    warn!(error = %e, "Failed to apply answer");
                }
                None
            }

            Command::StartConsuming => {
                info!(room = %self.config.room, mode = %self.config.mode, "Detection started");
                None
            }

            Command::StopConsuming => {
                info!(room = %self.config.room, "Detection stopped");
                self.slot.clear();
                None
            }

            Command::ResetPeer => {
                self.release_peer().await;
                None
            }

            Command::Release => {
                self.release_peer().await;
                None
            }
        }
    }

    async fn create_peer_and_offer(&mut self) -> Result<()> {
        let peer = Arc::new(
            ViewerPeer::new(self.config.stun_servers.clone(), self.peer_tx.clone()).await?,
        );
        let offer = peer.create_offer().await?;

        self.signaling.send(ClientMessage::Offer {
            room: self.config.room.clone(),
            offer,
        })?;

        self.peer = Some(peer);
        Ok(())
    }

    async fn apply_answer(&mut self) -> Result<()> {
        let answer = self
            .latest_answer
            .take()
            .ok_or_else(|| AppError::Signaling("no answer to apply".to_string()))?;
        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| AppError::Signaling("no peer connection".to_string()))?
            .clone();

        peer.apply_answer(answer).await?;

        // Process ICE candidates that arrived before the remote description
        for candidate in self.pending_candidates.drain(..) {
            if let Err(e) = peer.add_remote_candidate(candidate).await {
                debug!(error = %e, "Queued ICE candidate rejected");
            }
        }
        Ok(())
    }

    /// Drop the peer connection and abandon in-flight work
    async fn release_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                debug!(error = %e, "Peer close failed");
            }
        }
        self.slot.clear();
        self.pending_candidates.clear();
        self.latest_answer = None;
        // Dropping the correlation slot resolves any in-flight offload
        // wait immediately with an empty result
        self.pending_offload = None;
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::PeerJoined { peer_id, role } => {
                info!(peer = %peer_id, role = %role, "Peer joined");
                self.drive(ViewerEvent::PeerJoined(role)).await;
            }

            ServerMessage::PeerLeft { peer_id, role } => {
                info!(peer = %peer_id, role = %role, "Peer left");
                self.drive(ViewerEvent::PeerLeft(role)).await;
            }

            ServerMessage::Answer { answer, from } => {
                debug!(from = %from, "Answer received");
                self.latest_answer = Some(answer);
                self.drive(ViewerEvent::AnswerReceived).await;
            }

            ServerMessage::Offer { from, .. } => {
                // This session initiates offers; a remote offer is ignored
                debug!(from = %from, "Unexpected offer ignored");
            }

            ServerMessage::IceCandidate { candidate, from } => {
                debug!(from = %from, "ICE candidate received");
                match &self.peer {
                    Some(peer) if peer.has_remote_description().await => {
                        if let Err(e) = peer.add_remote_candidate(candidate).await {
                            debug!(error = %e, "ICE candidate rejected");
                        }
                    }
                    _ => self.pending_candidates.push(candidate),
                }
            }

            ServerMessage::DetectionResult(result) => {
                match self.pending_offload.take() {
                    Some(pending) if pending.frame_id == result.frame_id => {
                        // A receiver dropped by timeout makes this a no-op
                        let _ = pending.reply.send(result);
                    }
                    Some(pending) => {
                        debug!(frame_id = %result.frame_id, "Mismatched result discarded");
                        self.pending_offload = Some(pending);
                    }
                    None => {
                        debug!(frame_id = %result.frame_id, "Late result discarded");
                    }
                }
            }

            ServerMessage::ProcessingError { error } => {
                warn!(error = %error, "Engine reported processing error");
                self.events.publish(SystemEvent::SystemError {
                    module: "engine".to_string(),
                    message: error,
                });
                // No result will follow; let the waiting dispatch finish now
                self.pending_offload = None;
            }

            ServerMessage::ModelInitializationResult {
                success,
                load_time,
                error,
                ..
            } => {
                if success {
                    info!(load_time_ms = ?load_time, "Server model initialized");
                } else {
                    warn!(error = ?error, "Server model initialization failed");
                }
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::StateChanged(state) => {
                debug!(state = %state, "Peer connection state");
                if matches!(
                    state,
                    ConnectionState::Failed | ConnectionState::Disconnected | ConnectionState::Closed
                ) {
                    self.drive(ViewerEvent::TransportLost).await;
                }
            }

            PeerEvent::LocalIceCandidate(candidate) => {
                let message = ClientMessage::IceCandidate {
                    room: self.config.room.clone(),
                    candidate,
                };
                if let Err(e) = self.signaling.send(message) {
                    debug!(error = %e, "Failed to relay local ICE candidate");
                }
            }

            PeerEvent::FramesChannelOpen => {
                self.drive(ViewerEvent::TransportEstablished).await;
                if self.config.auto_start_detection
                    && self.machine.state() == ViewerState::Connected
                {
                    self.drive(ViewerEvent::DetectionToggled(true)).await;
                }
            }

            PeerEvent::FrameMessage(data) => {
                self.counters
                    .received
                    .fetch_add(data.len() as u64, Ordering::Relaxed);

                if self.machine.state() != ViewerState::Detecting {
                    return;
                }

                let frame: FrameRequest = match serde_json::from_slice(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed frame");
                        return;
                    }
                };

                if let Some(frame) = self.slot.offer(frame) {
                    self.dispatch(frame);
                }
            }
        }
    }

    /// Dispatch one frame according to the configured mode
    fn dispatch(&mut self, frame: FrameRequest) {
        match self.config.mode {
            DispatchMode::Local => self.dispatch_local(frame),
            DispatchMode::Offload => self.dispatch_offload(frame),
        }
    }

    /// Local mode: run the detector in-process; engine timestamps are the
    /// local times
    fn dispatch_local(&self, frame: FrameRequest) {
        let detector = self.detector.clone();
        let params = self.config.postprocess_params();
        let input_size = self.config.input_size;
        let done_tx = self.done_tx.clone();

        tokio::spawn(async move {
            let recv_ts = now_ms();
            let frame_id = frame.frame_id;
            let capture_ts = frame.capture_ts;
            let image_data = frame.image_data;

            let computed = match detector {
                Some(detector) => {
                    tokio::task::spawn_blocking(move || -> Result<Vec<Detection>> {
                        let tensor = preprocess::prepare(&image_data, input_size)?;
                        let candidates = detector.infer(&tensor)?;
                        Ok(postprocess(&candidates, &params))
                    })
                    .await
                    .unwrap_or_else(|e| Err(AppError::Internal(format!("inference task: {}", e))))
                }
                None => Err(AppError::ModelNotLoaded("local detector".to_string())),
            };

            let result = match computed {
                Ok(detections) => DetectionResult {
                    frame_id,
                    capture_ts,
                    recv_ts,
                    inference_ts: now_ms(),
                    detections,
                },
                Err(e) => {
                    warn!(error = %e, "Local inference failed");
                    DetectionResult::empty(frame_id, capture_ts, now_ms())
                }
            };

            let _ = done_tx.send(DispatchOutcome { result });
        });
    }

    /// Offload mode: re-encode at input size, ship through the broker and
    /// await the matching result under the configured timeout
    fn dispatch_offload(&mut self, frame: FrameRequest) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_offload = Some(PendingOffload {
            frame_id: frame.frame_id.clone(),
            reply: reply_tx,
        });

        let signaling = self.signaling.clone();
        let counters = self.counters.clone();
        let done_tx = self.done_tx.clone();
        let timeout = self.config.offload_timeout;
        let quality = self.config.offload_jpeg_quality;
        let input_size = self.config.input_size;
        let room = self.config.room.clone();

        tokio::spawn(async move {
            let frame_id = frame.frame_id;
            let capture_ts = frame.capture_ts;
            let image_data = frame.image_data;

            let prepared = tokio::task::spawn_blocking(move || -> Result<String> {
                let image = preprocess::decode_image(&image_data)?;
                let resized = preprocess::resize_to_input(&image, input_size);
                let jpeg = preprocess::encode_jpeg(&resized, quality)?;
                Ok(preprocess::to_data_uri(&jpeg))
            })
            .await
            .unwrap_or_else(|e| Err(AppError::Internal(format!("encode task: {}", e))));

            let result = match prepared {
                Ok(image_data) => {
                    let request = ClientMessage::ProcessFrame(FrameRequest {
                        room,
                        frame_id: frame_id.clone(),
                        capture_ts,
                        width: input_size,
                        height: input_size,
                        image_data,
                    });

                    let payload_len = serde_json::to_string(&request)
                        .map(|s| s.len() as u64)
                        .unwrap_or(0);

                    if signaling.send(request).is_err() {
                        DetectionResult::empty(frame_id, capture_ts, now_ms())
                    } else {
                        counters.sent.fetch_add(payload_len, Ordering::Relaxed);
                        match tokio::time::timeout(timeout, reply_rx).await {
                            Ok(Ok(result)) => result,
                            Ok(Err(_)) => {
                                // Correlation abandoned (peer left or error)
                                DetectionResult::empty(frame_id, capture_ts, now_ms())
                            }
                            Err(_) => {
                                debug!(frame_id = %frame_id, "Offload timed out");
                                DetectionResult::empty(frame_id, capture_ts, now_ms())
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Offload re-encode failed");
                    DetectionResult::empty(frame_id, capture_ts, now_ms())
                }
            };

            let _ = done_tx.send(DispatchOutcome { result });
        });
    }

    /// Fold a completed dispatch into telemetry, echo the result to the
    /// capture peer and promote the next pending frame
    async fn handle_outcome(&mut self, outcome: DispatchOutcome) {
        self.pending_offload = None;

        let now = now_ms();
        let local_mode = self.config.mode == DispatchMode::Local;
        self.telemetry.on_result(&outcome.result, now, local_mode);

        self.events.publish(SystemEvent::DetectionProduced {
            room: self.config.room.clone(),
            frame_id: outcome.result.frame_id.clone(),
            count: outcome.result.detections.len(),
        });
        self.events.publish(SystemEvent::TelemetryUpdated {
            room: self.config.room.clone(),
            e2e: self.telemetry.e2e_snapshot(),
            server_latency_ms: self.telemetry.last_server_ms(),
            network_latency_ms: self.telemetry.last_network_ms(),
            processed_fps: self.telemetry.processed_fps(now),
            bandwidth: self.telemetry.bandwidth_rates(),
        });

        // Return path: reverse channel if open, otherwise skipped
        if let Some(peer) = &self.peer {
            match serde_json::to_vec(&outcome.result) {
                Ok(payload) => match peer.send_detections(&payload).await {
                    Ok(true) => {
                        self.counters
                            .sent
                            .fetch_add(payload.len() as u64, Ordering::Relaxed);
                    }
                    Ok(false) => debug!("Reverse channel closed, result send skipped"),
                    Err(e) => debug!(error = %e, "Result send failed, not retried"),
                },
                Err(e) => warn!(error = %e, "Failed to serialize result"),
            }
        }

        if let Some(next) = self.slot.complete() {
            self.dispatch(next);
        }
    }

    fn record_transport_stats(&mut self) {
        self.telemetry.record_transport(
            now_ms(),
            self.counters.sent.load(Ordering::Relaxed),
            self.counters.received.load(Ordering::Relaxed),
        );
    }
}
