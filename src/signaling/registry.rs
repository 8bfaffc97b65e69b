//! Room registry
//!
//! Typed room bookkeeping for the signaling broker: each room holds at most
//! one capture peer and one viewer peer, each identified by its
//! control-connection id. All mutations go through a single mutex so join,
//! leave and relay observe a consistent snapshot; the lock is never held
//! across an await (outbound sends go over unbounded channels).

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::message::{PeerRole, ServerMessage};

/// Server-assigned control-connection identifier
pub type PeerId = String;

/// Outbound message channel for one connection
pub type PeerSender = mpsc::UnboundedSender<ServerMessage>;

/// Role slots of a single room
#[derive(Debug, Default)]
struct RoomSlots {
    capture: Option<PeerId>,
    viewer: Option<PeerId>,
}

impl RoomSlots {
    fn slot(&self, role: PeerRole) -> &Option<PeerId> {
        match role {
            PeerRole::Capture => &self.capture,
            PeerRole::Viewer => &self.viewer,
        }
    }

    fn slot_mut(&mut self, role: PeerRole) -> &mut Option<PeerId> {
        match role {
            PeerRole::Capture => &mut self.capture,
            PeerRole::Viewer => &mut self.viewer,
        }
    }

    fn is_empty(&self) -> bool {
        self.capture.is_none() && self.viewer.is_none()
    }

    fn occupants(&self) -> impl Iterator<Item = &PeerId> {
        self.capture.iter().chain(self.viewer.iter())
    }
}

/// Membership record of one connection
#[derive(Debug, Clone)]
struct PeerEntry {
    room: String,
    role: PeerRole,
}

/// Outcome of a join operation
#[derive(Debug)]
pub struct JoinOutcome {
    /// Pre-existing occupant of the opposite slot, if any
    pub existing: Option<(PeerId, PeerRole)>,
    /// Incumbent of the same slot that was evicted by this join
    pub evicted: Option<PeerId>,
}

/// Outcome of a disconnect or leave
#[derive(Debug)]
pub struct Departure {
    pub room: String,
    pub role: PeerRole,
    /// Peer remaining in the room, to be notified with peer-left
    pub remaining: Option<PeerId>,
    /// Whether the room descriptor was freed (both slots empty)
    pub room_freed: bool,
}

struct RegistryInner {
    rooms: HashMap<String, RoomSlots>,
    peers: HashMap<PeerId, PeerEntry>,
    senders: HashMap<PeerId, PeerSender>,
}

/// Shared room/connection registry for the broker
pub struct RoomRegistry {
    inner: Mutex<RegistryInner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                rooms: HashMap::new(),
                peers: HashMap::new(),
                senders: HashMap::new(),
            }),
        }
    }

    /// Register a connection's outbound channel
    pub fn register(&self, id: &str, sender: PeerSender) {
        self.inner.lock().senders.insert(id.to_string(), sender);
    }

    /// Associate a connection with a room slot
    ///
    /// A second join of an occupied role evicts the incumbent: the slot is
    /// overwritten and the evicted id is returned so the caller can notify
    /// the opposite peer. Re-joining from a connection already in a room
    /// first removes it from its previous room.
    pub fn join(&self, id: &str, room: &str, role: PeerRole) -> JoinOutcome {
        let mut inner = self.inner.lock();

        // A connection holds at most one membership
        if inner.peers.contains_key(id) {
            Self::remove_membership(&mut inner, id);
        }

        let slots = inner.rooms.entry(room.to_string()).or_default();

        let evicted = slots.slot_mut(role).replace(id.to_string());
        let existing = slots
            .slot(role.opposite())
            .clone()
            .map(|peer| (peer, role.opposite()));

        if let Some(ref old) = evicted {
            debug!(room, role = %role, evicted = %old, "Role slot incumbent evicted");
        }

        inner.peers.insert(
            id.to_string(),
            PeerEntry {
                room: room.to_string(),
                role,
            },
        );
        if let Some(ref old) = evicted {
            inner.peers.remove(old);
        }

        JoinOutcome { existing, evicted }
    }

    /// Remove a connection entirely (socket closed)
    ///
    /// Returns the departure record when the connection was in a room, so
    /// the caller can emit peer-left and tear down per-room state.
    pub fn disconnect(&self, id: &str) -> Option<Departure> {
        let mut inner = self.inner.lock();
        inner.senders.remove(id);
        Self::remove_membership(&mut inner, id)
    }

    fn remove_membership(inner: &mut RegistryInner, id: &str) -> Option<Departure> {
        let entry = inner.peers.remove(id)?;

        let (remaining, room_freed) = match inner.rooms.get_mut(&entry.room) {
            Some(slots) => {
                if slots.slot(entry.role).as_deref() == Some(id) {
                    *slots.slot_mut(entry.role) = None;
                }
                let remaining = slots.slot(entry.role.opposite()).clone();
                let freed = slots.is_empty();
                if freed {
                    inner.rooms.remove(&entry.room);
                }
                (remaining, freed)
            }
            None => (None, false),
        };

        Some(Departure {
            room: entry.room,
            role: entry.role,
            remaining,
            room_freed,
        })
    }

    /// Room and role of a connection, if it has joined one
    pub fn membership(&self, id: &str) -> Option<(String, PeerRole)> {
        self.inner
            .lock()
            .peers
            .get(id)
            .map(|e| (e.room.clone(), e.role))
    }

    /// All other peers currently in a room (relay fan-out targets)
    pub fn relay_targets(&self, sender_id: &str, room: &str) -> Vec<PeerId> {
        let inner = self.inner.lock();
        inner
            .rooms
            .get(room)
            .map(|slots| {
                slots
                    .occupants()
                    .filter(|peer| peer.as_str() != sender_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Viewer currently registered for a room
    pub fn viewer_of(&self, room: &str) -> Option<PeerId> {
        self.inner
            .lock()
            .rooms
            .get(room)
            .and_then(|slots| slots.viewer.clone())
    }

    /// Send a message to a connection
    ///
    /// Returns false when the connection is gone; relay failures are
    /// absorbed by the caller, they never propagate to the sender.
    pub fn send_to(&self, id: &str, message: ServerMessage) -> bool {
        let sender = self.inner.lock().senders.get(id).cloned();
        match sender {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Number of live rooms
    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    /// Occupant count of a room (0 when the room does not exist)
    pub fn occupancy(&self, room: &str) -> usize {
        self.inner
            .lock()
            .rooms
            .get(room)
            .map(|slots| slots.occupants().count())
            .unwrap_or(0)
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (PeerSender, mpsc::UnboundedReceiver<ServerMessage>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_join_empty_room() {
        let registry = RoomRegistry::new();
        let outcome = registry.join("v1", "abc", PeerRole::Viewer);

        assert!(outcome.existing.is_none());
        assert!(outcome.evicted.is_none());
        assert_eq!(registry.occupancy("abc"), 1);
        assert_eq!(
            registry.membership("v1"),
            Some(("abc".to_string(), PeerRole::Viewer))
        );
    }

    #[test]
    fn test_join_sees_existing_opposite_peer() {
        let registry = RoomRegistry::new();
        registry.join("v1", "abc", PeerRole::Viewer);
        let outcome = registry.join("c1", "abc", PeerRole::Capture);

        assert_eq!(outcome.existing, Some(("v1".to_string(), PeerRole::Viewer)));
        assert_eq!(registry.occupancy("abc"), 2);
    }

    #[test]
    fn test_second_join_evicts_incumbent() {
        let registry = RoomRegistry::new();
        registry.join("c1", "abc", PeerRole::Capture);
        let outcome = registry.join("c2", "abc", PeerRole::Capture);

        assert_eq!(outcome.evicted.as_deref(), Some("c1"));
        // Role still held by exactly one peer
        assert_eq!(registry.occupancy("abc"), 1);
        assert!(registry.membership("c1").is_none());
        assert!(registry.membership("c2").is_some());
    }

    #[test]
    fn test_slot_cardinality_invariant() {
        let registry = RoomRegistry::new();
        for i in 0..10 {
            let role = if i % 2 == 0 {
                PeerRole::Capture
            } else {
                PeerRole::Viewer
            };
            registry.join(&format!("p{}", i), "abc", role);
            assert!(registry.occupancy("abc") <= 2);
        }
    }

    #[test]
    fn test_disconnect_notifies_remaining_and_frees_room() {
        let registry = RoomRegistry::new();
        registry.join("v1", "abc", PeerRole::Viewer);
        registry.join("c1", "abc", PeerRole::Capture);

        let departure = registry.disconnect("c1").unwrap();
        assert_eq!(departure.role, PeerRole::Capture);
        assert_eq!(departure.remaining.as_deref(), Some("v1"));
        assert!(!departure.room_freed);
        assert_eq!(registry.room_count(), 1);

        let departure = registry.disconnect("v1").unwrap();
        assert!(departure.remaining.is_none());
        assert!(departure.room_freed);
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_disconnect_without_membership() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = channel();
        registry.register("x", tx);
        assert!(registry.disconnect("x").is_none());
    }

    #[test]
    fn test_relay_targets_scoped_to_room() {
        let registry = RoomRegistry::new();
        registry.join("v1", "abc", PeerRole::Viewer);
        registry.join("c1", "abc", PeerRole::Capture);
        registry.join("v2", "xyz", PeerRole::Viewer);

        let targets = registry.relay_targets("v1", "abc");
        assert_eq!(targets, vec!["c1".to_string()]);

        // No peer outside the room is a target
        assert!(registry.relay_targets("v2", "xyz").is_empty());
        assert!(registry.relay_targets("v1", "nope").is_empty());
    }

    #[test]
    fn test_viewer_of() {
        let registry = RoomRegistry::new();
        assert!(registry.viewer_of("abc").is_none());
        registry.join("c1", "abc", PeerRole::Capture);
        assert!(registry.viewer_of("abc").is_none());
        registry.join("v1", "abc", PeerRole::Viewer);
        assert_eq!(registry.viewer_of("abc").as_deref(), Some("v1"));
    }

    #[test]
    fn test_send_to_gone_peer() {
        let registry = RoomRegistry::new();
        let (tx, rx) = channel();
        registry.register("v1", tx);
        drop(rx);

        // Channel closed: send fails but does not panic
        assert!(!registry.send_to(
            "v1",
            ServerMessage::ProcessingError {
                error: "x".to_string()
            }
        ));
        assert!(!registry.send_to(
            "ghost",
            ServerMessage::ProcessingError {
                error: "x".to_string()
            }
        ));
    }

    #[test]
    fn test_rejoin_moves_connection() {
        let registry = RoomRegistry::new();
        registry.join("v1", "abc", PeerRole::Viewer);
        registry.join("v1", "xyz", PeerRole::Viewer);

        assert_eq!(registry.occupancy("abc"), 0);
        assert_eq!(registry.occupancy("xyz"), 1);
        assert_eq!(
            registry.membership("v1"),
            Some(("xyz".to_string(), PeerRole::Viewer))
        );
    }
}
