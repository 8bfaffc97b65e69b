//! Viewer orchestrator
//!
//! Client-side state machine that coordinates the WebRTC session for one
//! room, maintains a latest-only frame pipeline, dispatches inference
//! locally or to the server-side engine, echoes results back to the
//! capture peer, and computes end-to-end telemetry.
//!
//! ```text
//! broker <--ws--> session loop <--events-- ViewerPeer (data channels)
//!                     |
//!            latest-only frame slot
//!                     |
//!        local detector | offload round-trip (200 ms timeout)
//!                     |
//!        telemetry rings + reverse channel echo
//! ```

pub mod machine;
pub mod peer;
pub mod pipeline;
pub mod session;
pub mod signaling_client;
pub mod telemetry;

pub use machine::{StateMachine, ViewerEvent, ViewerState};
pub use pipeline::LatestFrameSlot;
pub use session::{run_session, SessionCommand, ViewerSessionConfig};
pub use telemetry::{TelemetrySummary, ViewerTelemetry};
