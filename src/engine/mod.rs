//! Server-side inference engine
//!
//! Holds the loaded detector and the frame-processing pipeline:
//!
//! ```text
//! process-frame (signaling)
//!        |
//!   per-room throttle (drop or admit)
//!        |
//!   dispatch queue -> worker task
//!        |
//!   decode -> resize -> tensor -> detector -> filter/NMS
//!        |
//!   detection-result -> room's viewer (signaling)
//! ```

pub mod detector;
pub mod labels;
pub mod postprocess;
pub mod preprocess;
pub mod service;
pub mod throttle;

pub use detector::Detector;
pub use postprocess::{postprocess, Candidate, PostprocessParams};
pub use service::{InferenceEngine, InitOutcome, ModelStatus};
pub use throttle::FrameThrottle;
