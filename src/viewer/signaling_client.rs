//! Signaling client
//!
//! WebSocket client side of the broker protocol: one writer task drains
//! outbound `ClientMessage`s, one reader task parses inbound
//! `ServerMessage`s into the session's event stream. Malformed inbound
//! messages are dropped with a warning.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::signaling::message::{ClientMessage, ServerMessage};

/// Cloneable send handle for the control connection
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl SignalingSender {
    /// Queue a message for the broker
    ///
    /// Fails only when the control connection is gone.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| AppError::Signaling("control connection closed".to_string()))
    }
}

/// Connected signaling client
pub struct SignalingClient {
    sender: SignalingSender,
    events: mpsc::UnboundedReceiver<ServerMessage>,
}

impl SignalingClient {
    /// Open the control connection to the broker
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| AppError::Signaling(format!("connect to {} failed: {}", url, e)))?;

        let (mut ws_sink, mut ws_stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerMessage>();

        // Writer task: serialize and push outbound messages
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize signaling message");
                        continue;
                    }
                };
                if ws_sink.send(WsMessage::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sink.send(WsMessage::Close(None)).await;
        });

        // Reader task: parse inbound messages into the event stream
        tokio::spawn(async move {
            while let Some(message) = ws_stream.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str(&text) {
                        Ok(parsed) => {
                            if in_tx.send(parsed).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed broker message");
                        }
                    },
                    Ok(WsMessage::Close(_)) => {
                        debug!("Broker closed the control connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "Control connection error");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            sender: SignalingSender { tx: out_tx },
            events: in_rx,
        })
    }

    /// Split into a send handle and the inbound event stream
    pub fn split(self) -> (SignalingSender, mpsc::UnboundedReceiver<ServerMessage>) {
        (self.sender, self.events)
    }
}
