//! Signaling WebSocket endpoint
//!
//! This module provides the broker endpoint at `/ws` that:
//! - Assigns a connection identifier to every client
//! - Registers capture and viewer peers into rooms
//! - Relays SDP offers/answers and ICE candidates verbatim
//! - Hands frame-inference requests to the engine
//!
//! Messages from a single sender reach a given recipient in the order the
//! sender produced them: each connection has one read loop and one
//! outbound channel drained by one writer task.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{ClientMessage, ServerMessage};
use crate::state::AppState;

/// WebSocket upgrade handler
///
/// This is the entry point for signaling connections at `/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one signaling connection for its whole lifetime
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerMessage>();

    state.rooms.register(&conn_id, tx);
    info!(conn = %conn_id, "Signaling client connected");

    // Writer task: drain the outbound channel into the socket
    let writer_conn = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(conn = %writer_conn, error = %e, "Failed to serialize outbound message");
                }
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_client_message(&state, &conn_id, &text).await;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // WebSocket layer handles keep-alive
            }
            Ok(Message::Close(_)) => {
                debug!(conn = %conn_id, "Close frame received");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %conn_id, error = %e, "Receive error");
                break;
            }
        }
    }

    writer.abort();
    teardown(&state, &conn_id);
    info!(conn = %conn_id, "Signaling client disconnected");
}

/// Clear the departing peer's slot and notify the remaining occupant
fn teardown(state: &AppState, conn_id: &str) {
    if let Some(departure) = state.rooms.disconnect(conn_id) {
        if let Some(remaining) = &departure.remaining {
            state.rooms.send_to(
                remaining,
                ServerMessage::PeerLeft {
                    peer_id: conn_id.to_string(),
                    role: departure.role,
                },
            );
        }
        if departure.room_freed {
            state.engine.forget_room(&departure.room);
            debug!(room = %departure.room, "Room freed");
        }
    }
}

/// Dispatch one parsed client message
///
/// Malformed messages are dropped with a logged warning; they never
/// terminate the connection.
async fn handle_client_message(state: &Arc<AppState>, conn_id: &str, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(conn = %conn_id, error = %e, "Dropping malformed signaling message");
            return;
        }
    };

    match message {
        ClientMessage::JoinRoom { room, role } => {
            let outcome = state.rooms.join(conn_id, &room, role);
            info!(conn = %conn_id, room = %room, role = %role, "Peer joined room");

            // The opposite slot hears the incumbent left before the
            // newcomer's arrival
            if let Some(evicted) = &outcome.evicted {
                if let Some((existing, _)) = &outcome.existing {
                    state.rooms.send_to(
                        existing,
                        ServerMessage::PeerLeft {
                            peer_id: evicted.clone(),
                            role,
                        },
                    );
                }
            }

            // The newcomer learns about the pre-existing peer before any
            // subsequent SDP/ICE relay can reach it
            if let Some((existing, existing_role)) = outcome.existing {
                state.rooms.send_to(
                    conn_id,
                    ServerMessage::PeerJoined {
                        peer_id: existing.clone(),
                        role: existing_role,
                    },
                );
                state.rooms.send_to(
                    &existing,
                    ServerMessage::PeerJoined {
                        peer_id: conn_id.to_string(),
                        role,
                    },
                );
            }
        }

        ClientMessage::Offer { room, offer } => {
            relay(state, conn_id, &room, |from| ServerMessage::Offer {
                offer: offer.clone(),
                from,
            });
        }

        ClientMessage::Answer { room, answer } => {
            relay(state, conn_id, &room, |from| ServerMessage::Answer {
                answer: answer.clone(),
                from,
            });
        }

        ClientMessage::IceCandidate { room, candidate } => {
            relay(state, conn_id, &room, |from| ServerMessage::IceCandidate {
                candidate: candidate.clone(),
                from,
            });
        }

        ClientMessage::ProcessFrame(frame) => {
            state.engine.submit(frame, conn_id);
        }

        ClientMessage::InitializeServerModel { room } => {
            let reply = match state.engine.initialize().await {
                Ok(outcome) => ServerMessage::ModelInitializationResult {
                    success: true,
                    message: Some(if outcome.already_loaded {
                        "Model already loaded".to_string()
                    } else {
                        "Model loaded".to_string()
                    }),
                    error: None,
                    load_time: Some(outcome.load_time_ms),
                    room,
                },
                Err(e) => ServerMessage::ModelInitializationResult {
                    success: false,
                    message: None,
                    error: Some(e.to_string()),
                    load_time: None,
                    room,
                },
            };
            state.rooms.send_to(conn_id, reply);
        }
    }
}

/// Forward a message to every other peer in the room, with the sender's
/// identifier attached
///
/// Relays from a connection that is not (or no longer) a member of the
/// room are dropped, as are relays into an empty opposite slot. Failures
/// are absorbed; they do not propagate to the sender.
fn relay<F>(state: &AppState, conn_id: &str, room: &str, build: F)
where
    F: Fn(String) -> ServerMessage,
{
    match state.rooms.membership(conn_id) {
        Some((member_room, _)) if member_room == room => {}
        _ => {
            debug!(conn = %conn_id, room, "Relay from non-member dropped");
            return;
        }
    }

    for target in state.rooms.relay_targets(conn_id, room) {
        if !state.rooms.send_to(&target, build(conn_id.to_string())) {
            debug!(conn = %conn_id, target = %target, "Relay target gone");
        }
    }
}
