use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::ConfigStore;
use crate::engine::InferenceEngine;
use crate::events::EventBus;
use crate::signaling::registry::RoomRegistry;

/// Application-wide state shared across handlers
///
/// The room registry and the detector handle are the two process-wide
/// singletons: rooms live only in memory (nothing survives a restart) and
/// the engine owns the single loaded detector.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Room registry (connection-id -> room/role, room -> role slots)
    pub rooms: Arc<RoomRegistry>,
    /// Inference engine
    pub engine: Arc<InferenceEngine>,
    /// Event bus for real-time notifications
    pub events: Arc<EventBus>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: ConfigStore,
        rooms: Arc<RoomRegistry>,
        engine: Arc<InferenceEngine>,
        events: Arc<EventBus>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            rooms,
            engine,
            events,
            shutdown_tx,
        })
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
