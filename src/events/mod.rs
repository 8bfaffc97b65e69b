//! Event system for real-time state notifications
//!
//! This module provides a global event bus for broadcasting system events
//! to the UI collaborator and other subscribers.

pub mod types;

pub use types::{BandwidthSnapshot, LatencySnapshot, SystemEvent};

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Global event bus for broadcasting system events
///
/// The event bus uses tokio's broadcast channel to distribute events
/// to multiple subscribers. Events are delivered to all active subscribers.
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    /// This is by design - events are fire-and-forget notifications.
    pub fn publish(&self, event: SystemEvent) {
        // If no subscribers, send returns Err which is normal
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// Returns a receiver that will receive all future events.
    /// The receiver uses a ring buffer, so if a subscriber falls too far
    /// behind, it will receive a `Lagged` error and miss some events.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SystemEvent::SystemError {
            module: "test".to_string(),
            message: "test message".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SystemEvent::SystemError { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SystemEvent::ModelStateChanged {
            loaded: true,
            load_time_ms: Some(12),
            error: None,
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            SystemEvent::ModelStateChanged { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            SystemEvent::ModelStateChanged { .. }
        ));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        // Should not panic when publishing with no subscribers
        bus.publish(SystemEvent::SystemError {
            module: "test".to_string(),
            message: "test".to_string(),
        });
    }
}
