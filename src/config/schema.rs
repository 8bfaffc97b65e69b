use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Detector model settings
    pub detector: DetectorConfig,
    /// Inference engine settings
    pub engine: EngineConfig,
    /// Viewer orchestrator settings
    pub viewer: ViewerConfig,
    /// Telemetry sampling settings
    pub telemetry: TelemetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            detector: DetectorConfig::default(),
            engine: EngineConfig::default(),
            viewer: ViewerConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// Listen address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Detector model configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    /// Path to the serialized detector asset
    pub model_path: String,
    /// Square input edge in pixels (model is fixed-input)
    pub input_size: u32,
    /// Minimum score for a candidate to survive filtering
    pub score_threshold: f32,
    /// Intersection-over-union threshold for non-maximum suppression
    pub iou_threshold: f32,
    /// Load the model at process start instead of on first request
    pub eager_load: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: "models/yolov5n.onnx".to_string(),
            input_size: 640,
            score_threshold: 0.45,
            iou_threshold: 0.5,
            eager_load: false,
        }
    }
}

/// Inference engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum interval between accepted frames per room (milliseconds)
    pub min_frame_interval_ms: u64,
    /// Dispatch queue capacity (accepted frames waiting for the worker)
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_frame_interval_ms: 100,
            queue_depth: 16,
        }
    }
}

/// Inference dispatch mode for the viewer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Run the detector in-process
    Local,
    /// Forward frames to the inference engine over the signaling path
    Offload,
}

impl Default for DispatchMode {
    fn default() -> Self {
        Self::Local
    }
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::Local => write!(f, "local"),
            DispatchMode::Offload => write!(f, "offload"),
        }
    }
}

impl std::str::FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(DispatchMode::Local),
            "offload" => Ok(DispatchMode::Offload),
            other => Err(format!("unknown dispatch mode: {}", other)),
        }
    }
}

/// Viewer orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewerConfig {
    /// Signaling endpoint URL (e.g. ws://127.0.0.1:8080/ws)
    pub server_url: String,
    /// Room identifier to join
    pub room: String,
    /// Inference dispatch mode
    pub mode: DispatchMode,
    /// Offloaded inference timeout (milliseconds)
    pub offload_timeout_ms: u64,
    /// JPEG quality for re-encoded offload frames (1-100)
    pub offload_jpeg_quality: u8,
    /// STUN servers for ICE gathering (host candidates only when empty)
    pub stun_servers: Vec<String>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            room: String::new(),
            mode: DispatchMode::Local,
            offload_timeout_ms: 200,
            offload_jpeg_quality: 70,
            stun_servers: Vec::new(),
        }
    }
}

/// Telemetry sampling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// End-to-end latency ring capacity
    pub latency_window: usize,
    /// Bandwidth snapshot ring capacity
    pub bandwidth_window: usize,
    /// Interval between transport statistics snapshots (milliseconds)
    pub stats_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            latency_window: 100,
            bandwidth_window: 10,
            stats_interval_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.web.http_port, 8080);
        assert_eq!(config.detector.input_size, 640);
        assert_eq!(config.detector.score_threshold, 0.45);
        assert_eq!(config.engine.min_frame_interval_ms, 100);
        assert_eq!(config.viewer.offload_timeout_ms, 200);
        assert_eq!(config.telemetry.latency_window, 100);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"web": {"http_port": 9000}}"#).unwrap();
        assert_eq!(config.web.http_port, 9000);
        assert_eq!(config.web.bind_address, "0.0.0.0");
        assert_eq!(config.detector.iou_threshold, 0.5);
    }

    #[test]
    fn test_dispatch_mode_parse() {
        assert_eq!("local".parse::<DispatchMode>().unwrap(), DispatchMode::Local);
        assert_eq!(
            "offload".parse::<DispatchMode>().unwrap(),
            DispatchMode::Offload
        );
        assert!("remote".parse::<DispatchMode>().is_err());
    }
}
