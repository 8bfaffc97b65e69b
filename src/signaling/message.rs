//! Signaling wire protocol
//!
//! JSON events exchanged over the `/ws` endpoint. Every event is a tagged
//! envelope `{"type": <name>, "payload": {...}}`. SDP bodies and ICE
//! candidates stay opaque `serde_json::Value`s - the broker relays them
//! verbatim and never inspects their contents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a peer inside a room
///
/// The wire names are `phone` (capture side) and `browser` (viewer side);
/// a room holds at most one of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// Produces encoded frames from a camera
    #[serde(rename = "phone")]
    Capture,
    /// Consumes frames and runs or forwards detection
    #[serde(rename = "browser")]
    Viewer,
}

impl PeerRole {
    /// The complementary role in the same room
    pub fn opposite(self) -> Self {
        match self {
            PeerRole::Capture => PeerRole::Viewer,
            PeerRole::Viewer => PeerRole::Capture,
        }
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Capture => write!(f, "capture"),
            PeerRole::Viewer => write!(f, "viewer"),
        }
    }
}

/// Frame-inference request
///
/// Created on the capture peer, transported over the peer-to-peer data
/// channel, and optionally forwarded to the inference engine over the
/// signaling path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRequest {
    /// Originating room
    pub room: String,
    /// Opaque frame identifier, unique within a session
    pub frame_id: String,
    /// Capture timestamp in milliseconds, monotonic across the session
    pub capture_ts: u64,
    /// Source width in pixels
    pub width: u32,
    /// Source height in pixels
    pub height: u32,
    /// Data-URI-prefixed base64 of the encoded image (JPEG by default)
    #[serde(rename = "imageData")]
    pub image_data: String,
}

/// A scored, labeled, normalized bounding box over the detector input frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    /// Class label from the fixed 80-entry catalogue
    pub label: String,
    /// Confidence score in (threshold, 1]
    pub score: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

/// Result of running the detector over one frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Echoes the originating request
    pub frame_id: String,
    /// Echoes the originating request
    pub capture_ts: u64,
    /// Engine ingress timestamp (milliseconds)
    pub recv_ts: u64,
    /// Inference-completion timestamp (milliseconds)
    pub inference_ts: u64,
    /// Surviving detections, ordered by score descending
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    /// Synthesize an empty result for a frame (offload timeout, peer loss)
    pub fn empty(frame_id: impl Into<String>, capture_ts: u64, now_ms: u64) -> Self {
        Self {
            frame_id: frame_id.into(),
            capture_ts,
            recv_ts: now_ms,
            inference_ts: now_ms,
            detections: Vec::new(),
        }
    }
}

/// Messages a client sends to the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Register the sender into a room slot
    JoinRoom {
        room: String,
        #[serde(rename = "type")]
        role: PeerRole,
    },
    /// SDP offer, relayed verbatim to the other peer in the room
    Offer { room: String, offer: Value },
    /// SDP answer, relayed verbatim to the other peer in the room
    Answer { room: String, answer: Value },
    /// ICE candidate, relayed verbatim to the other peer in the room
    IceCandidate { room: String, candidate: Value },
    /// Frame-inference request for the engine
    ProcessFrame(FrameRequest),
    /// Lazy-load the detector if not yet loaded
    InitializeServerModel { room: String },
}

/// Messages the broker sends to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// The opposite role is now present in the room
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "type")]
        role: PeerRole,
    },
    /// The opposite role departed
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "type")]
        role: PeerRole,
    },
    /// Relayed SDP offer with the sender's identifier attached
    Offer { offer: Value, from: String },
    /// Relayed SDP answer with the sender's identifier attached
    Answer { answer: Value, from: String },
    /// Relayed ICE candidate with the sender's identifier attached
    IceCandidate { candidate: Value, from: String },
    /// Detection result routed to the room's viewer
    DetectionResult(DetectionResult),
    /// Non-fatal per-frame failure, sent to the originating connection
    ProcessingError { error: String },
    /// Outcome of an initialize-server-model request
    ModelInitializationResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(rename = "loadTime", skip_serializing_if = "Option::is_none")]
        load_time: Option<u64>,
        room: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_room_wire_shape() {
        let msg = ClientMessage::JoinRoom {
            room: "abc".to_string(),
            role: PeerRole::Capture,
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "join-room");
        assert_eq!(json["payload"]["room"], "abc");
        assert_eq!(json["payload"]["type"], "phone");
    }

    #[test]
    fn test_offer_payload_is_opaque() {
        let raw = r#"{"type":"offer","payload":{"room":"abc","offer":{"sdp":"v=0...","type":"offer"}}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();

        match msg {
            ClientMessage::Offer { room, offer } => {
                assert_eq!(room, "abc");
                // The body survives untouched for verbatim relay
                assert_eq!(offer["sdp"], "v=0...");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_process_frame_round_trip() {
        let raw = r#"{
            "type": "process-frame",
            "payload": {
                "room": "abc",
                "frame_id": "f1",
                "capture_ts": 1000,
                "width": 640,
                "height": 480,
                "imageData": "data:image/jpeg;base64,/9j/4AAQ"
            }
        }"#;

        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::ProcessFrame(frame) => {
                assert_eq!(frame.frame_id, "f1");
                assert_eq!(frame.capture_ts, 1000);
                assert!(frame.image_data.starts_with("data:image/jpeg"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_peer_joined_wire_shape() {
        let msg = ServerMessage::PeerJoined {
            peer_id: "p-1".to_string(),
            role: PeerRole::Viewer,
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "peer-joined");
        assert_eq!(json["payload"]["peerId"], "p-1");
        assert_eq!(json["payload"]["type"], "browser");
    }

    #[test]
    fn test_detection_result_wire_shape() {
        let msg = ServerMessage::DetectionResult(DetectionResult {
            frame_id: "f1".to_string(),
            capture_ts: 1000,
            recv_ts: 1005,
            inference_ts: 1042,
            detections: vec![Detection {
                label: "person".to_string(),
                score: 0.9,
                xmin: 0.1,
                ymin: 0.2,
                xmax: 0.4,
                ymax: 0.8,
            }],
        });

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "detection-result");
        assert_eq!(json["payload"]["frame_id"], "f1");
        assert_eq!(json["payload"]["detections"][0]["label"], "person");
    }

    #[test]
    fn test_model_initialization_result_omits_absent_fields() {
        let msg = ServerMessage::ModelInitializationResult {
            success: true,
            message: Some("Model loaded".to_string()),
            error: None,
            load_time: Some(812),
            room: "abc".to_string(),
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "model-initialization-result");
        assert_eq!(json["payload"]["loadTime"], 812);
        assert!(json["payload"].get("error").is_none());
    }

    #[test]
    fn test_malformed_message_fails_to_parse() {
        // Missing required `room` field
        let raw = r#"{"type":"join-room","payload":{"type":"phone"}}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());

        let raw = r#"{"type":"no-such-event","payload":{}}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn test_role_opposite() {
        assert_eq!(PeerRole::Capture.opposite(), PeerRole::Viewer);
        assert_eq!(PeerRole::Viewer.opposite(), PeerRole::Capture);
    }

    #[test]
    fn test_empty_result_timestamps() {
        let result = DetectionResult::empty("f9", 1000, 1210);
        assert_eq!(result.frame_id, "f9");
        assert_eq!(result.capture_ts, 1000);
        assert_eq!(result.recv_ts, 1210);
        assert_eq!(result.inference_ts, 1210);
        assert!(result.detections.is_empty());
    }
}
