//! Per-room frame throttling
//!
//! Engine ingress admission control: each room keeps the timestamp of its
//! last accepted frame, and a new frame is accepted only when the minimum
//! inter-frame interval has elapsed. Rejected frames are dropped silently,
//! with no queue and no retry. The throttle is per-room so one active room
//! cannot starve another.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::utils::now_ms;

/// Per-room ingress throttle
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use peervision::engine::throttle::FrameThrottle;
///
/// let throttle = FrameThrottle::new(Duration::from_millis(100));
///
/// assert!(throttle.accept_at("room", 1000));
/// assert!(!throttle.accept_at("room", 1050));
/// assert!(throttle.accept_at("room", 1200));
/// ```
pub struct FrameThrottle {
    /// Map of room id to last accepted ingress timestamp (ms)
    last_accepted: RwLock<HashMap<String, u64>>,
    /// Minimum inter-frame interval
    interval_ms: u64,
}

impl FrameThrottle {
    /// Create a throttle with the given minimum inter-frame interval
    pub fn new(interval: Duration) -> Self {
        Self {
            last_accepted: RwLock::new(HashMap::new()),
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// Create a throttle with the interval specified in milliseconds
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// Check whether a frame arriving now is accepted for its room
    ///
    /// If `true` is returned, the room's slot timestamp is updated.
    pub fn accept(&self, room: &str) -> bool {
        self.accept_at(room, now_ms())
    }

    /// Check whether a frame arriving at `now_ms` is accepted for its room
    ///
    /// A frame arriving exactly at the interval boundary is accepted.
    pub fn accept_at(&self, room: &str, now_ms: u64) -> bool {
        // First check with read lock (fast path)
        {
            let map = self.last_accepted.read().unwrap();
            if let Some(last) = map.get(room) {
                if now_ms.saturating_sub(*last) < self.interval_ms {
                    return false;
                }
            }
        }

        // Update with write lock
        let mut map = self.last_accepted.write().unwrap();
        // Double-check after acquiring write lock
        if let Some(last) = map.get(room) {
            if now_ms.saturating_sub(*last) < self.interval_ms {
                return false;
            }
        }
        map.insert(room.to_string(), now_ms);
        true
    }

    /// Drop the slot for a room
    ///
    /// Called when a room is freed so the map does not accumulate entries
    /// for rooms that no longer exist.
    pub fn forget(&self, room: &str) {
        self.last_accepted.write().unwrap().remove(room);
    }

    /// Number of tracked rooms
    pub fn len(&self) -> usize {
        self.last_accepted.read().unwrap().len()
    }

    /// Check if no rooms are tracked
    pub fn is_empty(&self) -> bool {
        self.last_accepted.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_accepted() {
        let throttle = FrameThrottle::with_millis(100);
        assert!(throttle.accept_at("abc", 1000));
    }

    #[test]
    fn test_throttle_boundary() {
        // 99 ms apart: dropped; 101 ms apart: both processed
        let throttle = FrameThrottle::with_millis(100);
        assert!(throttle.accept_at("abc", 1000));
        assert!(!throttle.accept_at("abc", 1099));

        let throttle = FrameThrottle::with_millis(100);
        assert!(throttle.accept_at("abc", 1000));
        assert!(throttle.accept_at("abc", 1101));
    }

    #[test]
    fn test_rejected_frame_does_not_advance_slot() {
        let throttle = FrameThrottle::with_millis(100);
        assert!(throttle.accept_at("abc", 1000));
        // A burst of rejects never pushes the window forward
        assert!(!throttle.accept_at("abc", 1050));
        assert!(!throttle.accept_at("abc", 1090));
        assert!(throttle.accept_at("abc", 1100));
    }

    #[test]
    fn test_spec_drop_sequence() {
        // Frames at 1000, 1050, 1200: the middle one is dropped
        let throttle = FrameThrottle::with_millis(100);
        let accepted: Vec<bool> = [1000u64, 1050, 1200]
            .iter()
            .map(|ts| throttle.accept_at("abc", *ts))
            .collect();
        assert_eq!(accepted, vec![true, false, true]);
    }

    #[test]
    fn test_rooms_are_independent() {
        let throttle = FrameThrottle::with_millis(100);
        assert!(throttle.accept_at("abc", 1000));
        // Another room is not starved by the first one
        assert!(throttle.accept_at("xyz", 1001));
        assert!(!throttle.accept_at("abc", 1002));
    }

    #[test]
    fn test_forget() {
        let throttle = FrameThrottle::with_millis(100);
        assert!(throttle.accept_at("abc", 1000));
        assert_eq!(throttle.len(), 1);

        throttle.forget("abc");
        assert!(throttle.is_empty());
        // Fresh slot accepts immediately
        assert!(throttle.accept_at("abc", 1001));
    }

    #[test]
    fn test_wall_clock_accept() {
        let throttle = FrameThrottle::with_millis(10);
        assert!(throttle.accept("abc"));
        assert!(!throttle.accept("abc"));
    }
}
