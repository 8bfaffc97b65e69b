//! Viewer state machine
//!
//! Explicit state machine for the viewer-side session: events in,
//! commands out. All transitions are centralized here instead of being
//! scattered across connection callbacks, and the transition function is
//! pure so it can be tested without sockets or peers.

use tracing::debug;

use crate::signaling::message::PeerRole;

/// Viewer session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    /// Process start; nothing connected
    Idle,
    /// Control connection established, join-room sent
    Connecting,
    /// Join acknowledged; no capture peer present
    WaitingForPeer,
    /// Capture peer arrived; local offer being created
    Offering,
    /// Offer sent; exchanging answer and ICE
    Negotiating,
    /// Peer-to-peer transport established
    Connected,
    /// Consuming frames and dispatching inference
    Detecting,
    /// Terminal: session released
    Closed,
}

impl std::fmt::Display for ViewerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ViewerState::Idle => "idle",
            ViewerState::Connecting => "connecting",
            ViewerState::WaitingForPeer => "waiting-for-peer",
            ViewerState::Offering => "offering",
            ViewerState::Negotiating => "negotiating",
            ViewerState::Connected => "connected",
            ViewerState::Detecting => "detecting",
            ViewerState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerEvent {
    /// Control connection to the broker is open
    ControlOpened,
    /// join-room accepted by the broker
    JoinAcked,
    /// Opposite peer arrived in the room
    PeerJoined(PeerRole),
    /// Opposite peer departed
    PeerLeft(PeerRole),
    /// Local offer created and sent via the broker
    OfferSent,
    /// Remote answer arrived
    AnswerReceived,
    /// Data channel open; peer-to-peer transport usable
    TransportEstablished,
    /// Peer-to-peer transport failed or disconnected
    TransportLost,
    /// Detection consumption toggled by the caller
    DetectionToggled(bool),
    /// Session shutdown requested
    Shutdown,
}

/// Outputs of a transition, interpreted by the session task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Send join-room to the broker
    SendJoin,
    /// Create the peer connection and local offer, send via broker
    CreateOffer,
    /// Set the remote answer and process queued ICE candidates
    ApplyAnswer,
    /// Begin consuming frames from the data channel
    StartConsuming,
    /// Stop consuming frames
    StopConsuming,
    /// Drop the peer connection and abandon in-flight work
    ResetPeer,
    /// Release everything: peer connection, buffers, background tasks
    Release,
}

/// Viewer session state machine
pub struct StateMachine {
    state: ViewerState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ViewerState::Idle,
        }
    }

    pub fn state(&self) -> ViewerState {
        self.state
    }

    /// Apply one event, returning the commands the session must execute
    ///
    /// Events that are not meaningful in the current state are ignored;
    /// a single unexpected input never aborts the machine.
    pub fn apply(&mut self, event: ViewerEvent) -> Vec<Command> {
        use Command::*;
        use ViewerEvent::*;
        use ViewerState::*;

        let (next, commands): (ViewerState, Vec<Command>) = match (self.state, event) {
            (_, Shutdown) => (Closed, vec![Release]),
            (Closed, _) => (Closed, vec![]),

            (Idle, ControlOpened) => (Connecting, vec![SendJoin]),
            (Connecting, JoinAcked) => (WaitingForPeer, vec![]),

            (WaitingForPeer, PeerJoined(PeerRole::Capture)) => (Offering, vec![CreateOffer]),
            (Offering, OfferSent) => (Negotiating, vec![]),
            (Negotiating, AnswerReceived) => (Negotiating, vec![ApplyAnswer]),
            (Negotiating, TransportEstablished) => (Connected, vec![]),

            (Connected, DetectionToggled(true)) => (Detecting, vec![StartConsuming]),
            (Detecting, DetectionToggled(false)) => (Connected, vec![StopConsuming]),

            // Capture departure or transport loss rewinds to waiting
            (Offering | Negotiating | Connected | Detecting, PeerLeft(PeerRole::Capture)) => {
                (WaitingForPeer, vec![ResetPeer])
            }
            (Offering | Negotiating | Connected | Detecting, TransportLost) => {
                (WaitingForPeer, vec![ResetPeer])
            }

            (state, event) => {
                debug!(state = %state, ?event, "Event ignored in current state");
                (state, vec![])
            }
        };

        if next != self.state {
            debug!(from = %self.state, to = %next, "Viewer state transition");
        }
        self.state = next;
        commands
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(state_path: &[ViewerEvent]) -> StateMachine {
        let mut machine = StateMachine::new();
        for event in state_path {
            machine.apply(*event);
        }
        machine
    }

    fn happy_path_to_connected() -> Vec<ViewerEvent> {
        vec![
            ViewerEvent::ControlOpened,
            ViewerEvent::JoinAcked,
            ViewerEvent::PeerJoined(PeerRole::Capture),
            ViewerEvent::OfferSent,
            ViewerEvent::AnswerReceived,
            ViewerEvent::TransportEstablished,
        ]
    }

    #[test]
    fn test_happy_path() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.state(), ViewerState::Idle);

        assert_eq!(
            machine.apply(ViewerEvent::ControlOpened),
            vec![Command::SendJoin]
        );
        assert_eq!(machine.state(), ViewerState::Connecting);

        machine.apply(ViewerEvent::JoinAcked);
        assert_eq!(machine.state(), ViewerState::WaitingForPeer);

        assert_eq!(
            machine.apply(ViewerEvent::PeerJoined(PeerRole::Capture)),
            vec![Command::CreateOffer]
        );
        assert_eq!(machine.state(), ViewerState::Offering);

        machine.apply(ViewerEvent::OfferSent);
        assert_eq!(machine.state(), ViewerState::Negotiating);

        assert_eq!(
            machine.apply(ViewerEvent::AnswerReceived),
            vec![Command::ApplyAnswer]
        );
        assert_eq!(machine.state(), ViewerState::Negotiating);

        machine.apply(ViewerEvent::TransportEstablished);
        assert_eq!(machine.state(), ViewerState::Connected);
    }

    #[test]
    fn test_detection_toggle() {
        let mut machine = machine_in(&happy_path_to_connected());

        assert_eq!(
            machine.apply(ViewerEvent::DetectionToggled(true)),
            vec![Command::StartConsuming]
        );
        assert_eq!(machine.state(), ViewerState::Detecting);

        assert_eq!(
            machine.apply(ViewerEvent::DetectionToggled(false)),
            vec![Command::StopConsuming]
        );
        assert_eq!(machine.state(), ViewerState::Connected);
    }

    #[test]
    fn test_peer_churn_returns_to_waiting() {
        // Viewer joins, capture joins, capture disconnects
        let mut machine = machine_in(&happy_path_to_connected());
        machine.apply(ViewerEvent::DetectionToggled(true));

        let commands = machine.apply(ViewerEvent::PeerLeft(PeerRole::Capture));
        assert_eq!(commands, vec![Command::ResetPeer]);
        assert_eq!(machine.state(), ViewerState::WaitingForPeer);

        // A new capture peer can re-establish the session
        assert_eq!(
            machine.apply(ViewerEvent::PeerJoined(PeerRole::Capture)),
            vec![Command::CreateOffer]
        );
    }

    #[test]
    fn test_transport_loss_mid_negotiation() {
        let mut machine = machine_in(&[
            ViewerEvent::ControlOpened,
            ViewerEvent::JoinAcked,
            ViewerEvent::PeerJoined(PeerRole::Capture),
            ViewerEvent::OfferSent,
        ]);

        machine.apply(ViewerEvent::TransportLost);
        assert_eq!(machine.state(), ViewerState::WaitingForPeer);
    }

    #[test]
    fn test_shutdown_terminal_from_any_state() {
        for path in [
            vec![],
            vec![ViewerEvent::ControlOpened],
            happy_path_to_connected(),
        ] {
            let mut machine = machine_in(&path);
            assert_eq!(machine.apply(ViewerEvent::Shutdown), vec![Command::Release]);
            assert_eq!(machine.state(), ViewerState::Closed);

            // Closed is terminal
            assert!(machine.apply(ViewerEvent::ControlOpened).is_empty());
            assert_eq!(machine.state(), ViewerState::Closed);
        }
    }

    #[test]
    fn test_unexpected_events_ignored() {
        let mut machine = StateMachine::new();
        assert!(machine.apply(ViewerEvent::AnswerReceived).is_empty());
        assert_eq!(machine.state(), ViewerState::Idle);

        // Viewer arrival does not trigger an offer; only capture does
        let mut machine = machine_in(&[ViewerEvent::ControlOpened, ViewerEvent::JoinAcked]);
        assert!(machine
            .apply(ViewerEvent::PeerJoined(PeerRole::Viewer))
            .is_empty());
        assert_eq!(machine.state(), ViewerState::WaitingForPeer);
    }
}
