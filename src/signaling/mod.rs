//! Signaling broker
//!
//! Brokers WebRTC sessions between a capture peer and a viewer peer keyed
//! by a room identifier. The broker groups long-lived control connections
//! by room, relays SDP and ICE payloads verbatim, and announces peer
//! arrivals and departures. Room state lives only in memory.

pub mod message;
pub mod registry;
pub mod ws;

pub use message::{
    ClientMessage, Detection, DetectionResult, FrameRequest, PeerRole, ServerMessage,
};
pub use registry::{PeerId, RoomRegistry};
pub use ws::ws_handler;
