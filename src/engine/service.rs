//! Inference engine service
//!
//! Owns the detector lifecycle and the dispatch pipeline: frame requests
//! are admitted through the per-room throttle, handed to a single worker
//! task that owns detector invocation, and the resulting detection records
//! are routed back to the room's registered viewer over the signaling
//! path. The transport handler never blocks on inference.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::detector::Detector;
use super::postprocess::{postprocess, PostprocessParams};
use super::preprocess;
use super::throttle::FrameThrottle;
use crate::config::{DetectorConfig, EngineConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::signaling::message::{Detection, DetectionResult, FrameRequest, ServerMessage};
use crate::signaling::registry::RoomRegistry;
use crate::utils::now_ms;

/// An admitted frame waiting for the worker
struct Job {
    frame: FrameRequest,
    origin: String,
    recv_ts: u64,
}

/// Detector availability report for the HTTP side channel
#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub loaded: bool,
    pub model_path: String,
    pub last_error: Option<String>,
}

/// Outcome of an initialize request
#[derive(Debug, Clone, Copy)]
pub struct InitOutcome {
    /// The handle already existed; no load was performed
    pub already_loaded: bool,
    /// Load duration in milliseconds (0 when already loaded)
    pub load_time_ms: u64,
}

/// Server-side inference engine
pub struct InferenceEngine {
    config: DetectorConfig,
    detector: RwLock<Option<Arc<Detector>>>,
    /// Serializes load attempts so initialization is idempotent
    load_lock: Mutex<()>,
    last_load_error: parking_lot::Mutex<Option<String>>,
    throttle: FrameThrottle,
    jobs_tx: mpsc::Sender<Job>,
    registry: Arc<RoomRegistry>,
    events: Arc<EventBus>,
}

impl InferenceEngine {
    /// Create the engine and spawn its dispatch worker
    pub fn new(
        config: DetectorConfig,
        engine_config: &EngineConfig,
        registry: Arc<RoomRegistry>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel(engine_config.queue_depth.max(1));

        let engine = Arc::new(Self {
            throttle: FrameThrottle::with_millis(engine_config.min_frame_interval_ms),
            config,
            detector: RwLock::new(None),
            load_lock: Mutex::new(()),
            last_load_error: parking_lot::Mutex::new(None),
            jobs_tx,
            registry,
            events,
        });

        tokio::spawn(Self::worker(engine.clone(), jobs_rx));

        engine
    }

    /// Admit a frame request from the signaling path
    ///
    /// Throttle-rejected frames are dropped silently; there is no queue
    /// for them, no reordering and no retry. Accepted frames are handed to
    /// the worker so the caller never blocks on inference.
    pub fn submit(&self, frame: FrameRequest, origin: &str) {
        let recv_ts = now_ms();

        if !self.throttle.accept_at(&frame.room, recv_ts) {
            trace!(room = %frame.room, frame_id = %frame.frame_id, "Frame dropped by throttle");
            return;
        }

        let job = Job {
            origin: origin.to_string(),
            recv_ts,
            frame,
        };

        // An accepted frame must still yield exactly one emission
        if self.jobs_tx.try_send(job).is_err() {
            warn!("Inference queue full, dropping accepted frame");
            self.emit_error(origin, "Inference queue full, frame dropped".to_string());
        }
    }

    /// Load the detector if not yet loaded
    ///
    /// Idempotent: a second initialization returns the cached handle. A
    /// failed load is remembered for `/model-status` and retried on the
    /// next request.
    pub async fn initialize(&self) -> Result<InitOutcome> {
        if self.detector.read().await.is_some() {
            return Ok(InitOutcome {
                already_loaded: true,
                load_time_ms: 0,
            });
        }

        let _guard = self.load_lock.lock().await;

        // Another caller may have finished the load while we waited
        if self.detector.read().await.is_some() {
            return Ok(InitOutcome {
                already_loaded: true,
                load_time_ms: 0,
            });
        }

        let path = PathBuf::from(&self.config.model_path);
        let input_size = self.config.input_size;
        let start = Instant::now();

        let loaded = tokio::task::spawn_blocking(move || Detector::load(&path, input_size))
            .await
            .map_err(|e| AppError::ModelLoad(format!("load task failed: {}", e)))?;

        match loaded {
            Ok(detector) => {
                let load_time_ms = start.elapsed().as_millis() as u64;
                *self.detector.write().await = Some(Arc::new(detector));
                *self.last_load_error.lock() = None;

                info!(load_time_ms, "Detector initialized");
                self.events.publish(SystemEvent::ModelStateChanged {
                    loaded: true,
                    load_time_ms: Some(load_time_ms),
                    error: None,
                });

                Ok(InitOutcome {
                    already_loaded: false,
                    load_time_ms,
                })
            }
            Err(e) => {
                let message = e.to_string();
                *self.last_load_error.lock() = Some(message.clone());

                warn!(error = %message, "Detector load failed");
                self.events.publish(SystemEvent::ModelStateChanged {
                    loaded: false,
                    load_time_ms: None,
                    error: Some(message),
                });

                Err(e)
            }
        }
    }

    /// Current model availability
    pub async fn status(&self) -> ModelStatus {
        ModelStatus {
            loaded: self.detector.read().await.is_some(),
            model_path: self.config.model_path.clone(),
            last_error: self.last_load_error.lock().clone(),
        }
    }

    /// Drop per-room throttle state when a room is freed
    pub fn forget_room(&self, room: &str) {
        self.throttle.forget(room);
    }

    /// Postprocessing parameters derived from configuration
    fn postprocess_params(&self) -> PostprocessParams {
        PostprocessParams {
            input_size: self.config.input_size as f32,
            score_threshold: self.config.score_threshold,
            iou_threshold: self.config.iou_threshold,
        }
    }

    /// Cached detector handle, loading lazily on first use
    async fn detector_handle(&self) -> Result<Arc<Detector>> {
        if let Some(detector) = self.detector.read().await.clone() {
            return Ok(detector);
        }

        self.initialize().await?;

        self.detector
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::ModelNotLoaded(self.config.model_path.clone()))
    }

    /// Dispatch worker: owns all detector invocations
    ///
    /// Results for a single room are emitted in accepted-ingress order:
    /// the throttle admits at most one in-flight frame per room and this
    /// loop processes jobs sequentially.
    async fn worker(self: Arc<Self>, mut jobs_rx: mpsc::Receiver<Job>) {
        debug!("Inference worker started");
        while let Some(job) = jobs_rx.recv().await {
            self.process(job).await;
        }
        debug!("Inference worker stopped");
    }

    async fn process(&self, job: Job) {
        let detector = match self.detector_handle().await {
            Ok(detector) => detector,
            Err(e) => {
                self.emit_error(&job.origin, e.to_string());
                return;
            }
        };

        let params = self.postprocess_params();
        let input_size = self.config.input_size;
        let image_data = job.frame.image_data.clone();

        let outcome = tokio::task::spawn_blocking(move || -> Result<Vec<Detection>> {
            let tensor = preprocess::prepare(&image_data, input_size)?;
            let candidates = detector.infer(&tensor)?;
            Ok(postprocess(&candidates, &params))
        })
        .await;

        match outcome {
            Ok(Ok(detections)) => {
                let result = DetectionResult {
                    frame_id: job.frame.frame_id,
                    capture_ts: job.frame.capture_ts,
                    recv_ts: job.recv_ts,
                    inference_ts: now_ms(),
                    detections,
                };
                self.route_result(&job.frame.room, result);
            }
            Ok(Err(e)) => {
                // Failed frame still counts as an accepted throttle slot
                debug!(room = %job.frame.room, error = %e, "Frame processing failed");
                self.emit_error(&job.origin, e.to_string());
            }
            Err(e) => {
                warn!(error = %e, "Inference task panicked");
                self.emit_error(&job.origin, format!("inference task failed: {}", e));
            }
        }
    }

    /// Deliver a result to the room's current viewer, dropping it when
    /// no viewer is registered at completion time.
    fn route_result(&self, room: &str, result: DetectionResult) {
        match self.registry.viewer_of(room) {
            Some(viewer) => {
                if !self
                    .registry
                    .send_to(&viewer, ServerMessage::DetectionResult(result))
                {
                    debug!(room, "Viewer gone mid-relay, result dropped");
                }
            }
            None => {
                debug!(room, "No viewer registered, result dropped");
            }
        }
    }

    fn emit_error(&self, origin: &str, error: String) {
        let delivered = self
            .registry
            .send_to(origin, ServerMessage::ProcessingError { error });
        if !delivered {
            debug!(origin, "Originator gone, processing error dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::message::PeerRole;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    fn test_engine(registry: Arc<RoomRegistry>) -> Arc<InferenceEngine> {
        let detector = DetectorConfig {
            model_path: "/nonexistent/model.onnx".to_string(),
            ..DetectorConfig::default()
        };
        InferenceEngine::new(
            detector,
            &EngineConfig::default(),
            registry,
            Arc::new(EventBus::new()),
        )
    }

    fn frame(room: &str, frame_id: &str, capture_ts: u64) -> FrameRequest {
        FrameRequest {
            room: room.to_string(),
            frame_id: frame_id.to_string(),
            capture_ts,
            width: 640,
            height: 640,
            image_data: "data:image/jpeg;base64,AAAA".to_string(),
        }
    }

    #[tokio::test]
    async fn test_missing_model_yields_processing_error() {
        let registry = Arc::new(RoomRegistry::new());
        let (tx, mut rx) = unbounded_channel();
        registry.register("c1", tx);
        registry.join("c1", "abc", PeerRole::Capture);

        let engine = test_engine(registry);
        engine.submit(frame("abc", "f1", 1000), "c1");

        let reply = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no reply")
            .expect("channel closed");
        assert!(matches!(reply, ServerMessage::ProcessingError { .. }));
    }

    #[tokio::test]
    async fn test_throttle_drops_second_frame() {
        let registry = Arc::new(RoomRegistry::new());
        let (tx, mut rx) = unbounded_channel();
        registry.register("c1", tx);
        registry.join("c1", "abc", PeerRole::Capture);

        let engine = test_engine(registry);
        // Two frames inside one interval: exactly one emission
        engine.submit(frame("abc", "f1", 1000), "c1");
        engine.submit(frame("abc", "f2", 1010), "c1");

        let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(first.is_some());
        let second = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(second.is_err(), "throttled frame must produce no emission");
    }

    #[tokio::test]
    async fn test_full_queue_emits_processing_error() {
        let registry = Arc::new(RoomRegistry::new());
        let (tx, mut rx) = unbounded_channel();
        registry.register("c1", tx);
        registry.join("c1", "abc", PeerRole::Capture);

        let detector = DetectorConfig {
            model_path: "/nonexistent/model.onnx".to_string(),
            ..DetectorConfig::default()
        };
        let engine = InferenceEngine::new(
            detector,
            &EngineConfig {
                queue_depth: 1,
                ..EngineConfig::default()
            },
            registry,
            Arc::new(EventBus::new()),
        );

        // Single-threaded test runtime: the worker cannot drain between
        // these synchronous submits, so the second accepted frame (its
        // own room, so not throttled) overflows the one-slot queue
        engine.submit(frame("abc", "f1", 1000), "c1");
        engine.submit(frame("xyz", "f2", 1000), "c1");

        let reply = rx.try_recv().expect("queue overflow must emit an error");
        match reply {
            ServerMessage::ProcessingError { error } => {
                assert!(error.contains("queue full"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initialize_failure_is_recoverable() {
        let registry = Arc::new(RoomRegistry::new());
        let engine = test_engine(registry);

        assert!(engine.initialize().await.is_err());

        let status = engine.status().await;
        assert!(!status.loaded);
        assert!(status.last_error.is_some());

        // A later initialize retries instead of wedging
        assert!(engine.initialize().await.is_err());
    }
}
