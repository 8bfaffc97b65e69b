//! Application configuration
//!
//! Nested serde sections with `#[serde(default)]` so a partial seed file
//! only overrides what it names. Reads are lock-free through `ConfigStore`.

pub mod schema;
pub mod store;

pub use schema::{
    AppConfig, DetectorConfig, DispatchMode, EngineConfig, TelemetryConfig, ViewerConfig,
    WebConfig,
};
pub use store::{ConfigChange, ConfigStore};
