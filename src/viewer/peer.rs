//! Viewer peer connection
//!
//! WebRTC peer connection in the offerer role: the viewer creates the
//! `frames` data channel (capture -> viewer) and the `detections` reverse
//! channel (viewer -> capture), sends its offer through the broker, and
//! forwards connection events into the session's single event loop.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{AppError, Result};

/// Label of the capture-to-viewer frame channel
const FRAMES_CHANNEL: &str = "frames";
/// Label of the viewer-to-capture result channel
const DETECTIONS_CHANNEL: &str = "detections";

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Events the peer connection feeds into the session loop
#[derive(Debug)]
pub enum PeerEvent {
    /// Underlying connection state changed
    StateChanged(ConnectionState),
    /// Locally gathered ICE candidate, to be relayed via the broker
    LocalIceCandidate(Value),
    /// Frame channel is open; peer-to-peer transport established
    FramesChannelOpen,
    /// JSON-encoded frame request arrived on the frame channel
    FrameMessage(Bytes),
}

/// Viewer-side peer connection wrapper
pub struct ViewerPeer {
    pc: Arc<RTCPeerConnection>,
    detections_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    remote_description_set: RwLock<bool>,
}

impl ViewerPeer {
    /// Create a peer connection wired to the given event channel
    pub async fn new(
        stun_servers: Vec<String>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![];
        for stun_url in stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url],
                ..Default::default()
            });
        }

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        let peer = Self {
            pc,
            detections_channel: Arc::new(RwLock::new(None)),
            remote_description_set: RwLock::new(false),
        };

        peer.setup_event_handlers(events_tx.clone()).await;
        peer.create_channels(events_tx).await?;

        Ok(peer)
    }

    /// Set up peer connection event handlers
    async fn setup_event_handlers(&self, events_tx: mpsc::UnboundedSender<PeerEvent>) {
        // Connection state change handler
        let state_tx = events_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state_tx = state_tx.clone();

                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };
                    let _ = state_tx.send(PeerEvent::StateChanged(new_state));
                })
            }));

        // ICE candidate handler
        let ice_tx = events_tx.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let ice_tx = ice_tx.clone();

                Box::pin(async move {
                    if let Some(c) = candidate {
                        match c.to_json().map(|init| serde_json::to_value(init)) {
                            Ok(Ok(value)) => {
                                let _ = ice_tx.send(PeerEvent::LocalIceCandidate(value));
                            }
                            _ => debug!("Failed to serialize local ICE candidate"),
                        }
                    }
                })
            }));

        // A capture peer that creates its own frame channel is adopted here
        let adopt_tx = events_tx;
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let adopt_tx = adopt_tx.clone();
                let label = dc.label().to_string();

                Box::pin(async move {
                    if label == FRAMES_CHANNEL {
                        info!("Capture-created frame channel adopted");
                        Self::wire_frames_channel(&dc, adopt_tx);
                    } else {
                        debug!(label = %label, "Ignoring unexpected data channel");
                    }
                })
            }));
    }

    /// Create the frame and detection channels (viewer is the offerer)
    async fn create_channels(&self, events_tx: mpsc::UnboundedSender<PeerEvent>) -> Result<()> {
        let frames = self
            .pc
            .create_data_channel(FRAMES_CHANNEL, None)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create frame channel: {}", e)))?;
        Self::wire_frames_channel(&frames, events_tx);

        let detections = self
            .pc
            .create_data_channel(DETECTIONS_CHANNEL, None)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create result channel: {}", e)))?;
        *self.detections_channel.write().await = Some(detections);

        Ok(())
    }

    /// Attach open/message handlers to a frame channel
    fn wire_frames_channel(dc: &Arc<RTCDataChannel>, events_tx: mpsc::UnboundedSender<PeerEvent>) {
        let open_tx = events_tx.clone();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(PeerEvent::FramesChannelOpen);
            Box::pin(async {})
        }));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = events_tx.send(PeerEvent::FrameMessage(msg.data));
            Box::pin(async {})
        }));
    }

    /// Create the local offer and return it for relay through the broker
    pub async fn create_offer(&self) -> Result<Value> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to set local description: {}", e)))?;

        serde_json::to_value(&offer)
            .map_err(|e| AppError::WebRtc(format!("Failed to serialize offer: {}", e)))
    }

    /// Apply the remote answer relayed by the broker
    pub async fn apply_answer(&self, answer: Value) -> Result<()> {
        let sdp = answer
            .get("sdp")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::WebRtc("Answer payload missing sdp".to_string()))?;

        let desc = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| AppError::WebRtc(format!("Invalid SDP answer: {}", e)))?;

        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to set remote description: {}", e)))?;

        *self.remote_description_set.write().await = true;
        Ok(())
    }

    /// Whether the remote description has been applied
    ///
    /// ICE candidates arriving earlier must be queued by the caller.
    pub async fn has_remote_description(&self) -> bool {
        *self.remote_description_set.read().await
    }

    /// Add a remote ICE candidate relayed by the broker
    ///
    /// Accepts both candidate-init objects and bare candidate strings.
    pub async fn add_remote_candidate(&self, candidate: Value) -> Result<()> {
        let init: RTCIceCandidateInit = if let Some(text) = candidate.as_str() {
            RTCIceCandidateInit {
                candidate: text.to_string(),
                ..Default::default()
            }
        } else {
            serde_json::from_value(candidate)
                .map_err(|e| AppError::WebRtc(format!("Invalid ICE candidate: {}", e)))?
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to add ICE candidate: {}", e)))
    }

    /// Send a detection result payload on the reverse channel
    ///
    /// Returns false when the channel is not open; the send is skipped,
    /// never retried and never buffered.
    pub async fn send_detections(&self, payload: &[u8]) -> Result<bool> {
        let channel = self.detections_channel.read().await;
        let Some(dc) = channel.as_ref() else {
            return Ok(false);
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            return Ok(false);
        }

        dc.send(&Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to send detections: {}", e)))?;
        Ok(true)
    }

    /// Close the connection
    pub async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}
