//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

/// Latency statistics derived from the viewer's sample ring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencySnapshot {
    /// Median end-to-end latency (milliseconds)
    pub median_ms: f64,
    /// 95th percentile end-to-end latency (milliseconds)
    pub p95_ms: f64,
    /// Average end-to-end latency (milliseconds)
    pub average_ms: f64,
    /// Minimum observed latency (milliseconds)
    pub min_ms: f64,
    /// Maximum observed latency (milliseconds)
    pub max_ms: f64,
}

/// Bandwidth estimate derived from transport statistics snapshots
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BandwidthSnapshot {
    /// Outbound rate in kilobits per second
    pub uplink_kbps: f64,
    /// Inbound rate in kilobits per second
    pub downlink_kbps: f64,
}

/// System event enumeration
///
/// All events are tagged with their event name for serialization.
/// The `serde(tag = "event", content = "data")` attribute creates a
/// JSON structure like:
/// ```json
/// {"event": "viewer.state_changed", "data": {"state": "detecting"}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// Viewer state machine transition
    #[serde(rename = "viewer.state_changed")]
    ViewerStateChanged {
        /// New state name
        state: String,
        /// Room the viewer session belongs to
        room: String,
    },

    /// Telemetry recomputed after a detection result
    #[serde(rename = "viewer.telemetry")]
    TelemetryUpdated {
        room: String,
        /// End-to-end latency statistics over the sample window
        e2e: LatencySnapshot,
        /// Server-side inference latency of the last result (ms, 0 in local mode)
        server_latency_ms: f64,
        /// Network transfer latency of the last result (ms, 0 in local mode)
        network_latency_ms: f64,
        /// Processed frames per second over the session
        processed_fps: f64,
        /// Transport bandwidth estimate
        bandwidth: BandwidthSnapshot,
    },

    /// A detection result was produced for a frame
    #[serde(rename = "viewer.detection")]
    DetectionProduced {
        room: String,
        frame_id: String,
        /// Number of surviving detections
        count: usize,
    },

    /// Detector model lifecycle change
    #[serde(rename = "engine.model_state")]
    ModelStateChanged {
        loaded: bool,
        /// Load duration in milliseconds when a load just completed
        load_time_ms: Option<u64>,
        error: Option<String>,
    },

    /// Non-fatal error notification
    #[serde(rename = "system.error")]
    SystemError {
        /// Module that reported the error
        module: String,
        message: String,
    },
}

impl SystemEvent {
    /// Check if this event matches a topic pattern
    ///
    /// Supports exact matches ("viewer.telemetry") and prefix wildcards
    /// ("viewer.*").
    pub fn matches_topic(&self, topic: &str) -> bool {
        let name = self.topic_name();
        if let Some(prefix) = topic.strip_suffix(".*") {
            name.starts_with(prefix)
        } else {
            name == topic
        }
    }

    /// Topic name used for subscription filtering
    pub fn topic_name(&self) -> &'static str {
        match self {
            SystemEvent::ViewerStateChanged { .. } => "viewer.state_changed",
            SystemEvent::TelemetryUpdated { .. } => "viewer.telemetry",
            SystemEvent::DetectionProduced { .. } => "viewer.detection",
            SystemEvent::ModelStateChanged { .. } => "engine.model_state",
            SystemEvent::SystemError { .. } => "system.error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        let event = SystemEvent::ViewerStateChanged {
            state: "detecting".to_string(),
            room: "abc".to_string(),
        };

        assert!(event.matches_topic("viewer.state_changed"));
        assert!(event.matches_topic("viewer.*"));
        assert!(!event.matches_topic("engine.*"));
        assert!(!event.matches_topic("viewer.telemetry"));
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = SystemEvent::DetectionProduced {
            room: "abc".to_string(),
            frame_id: "f1".to_string(),
            count: 3,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "viewer.detection");
        assert_eq!(json["data"]["count"], 3);
    }
}
