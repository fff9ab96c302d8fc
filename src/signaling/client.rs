//! WebSocket Client für das Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Nachrichten serialisieren und senden
//! - Eingehende Nachrichten parsen und in Ankunftsreihenfolge weiterleiten
//! - Keep-Alive per WebSocket-Ping

use super::messages::*;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Intervall für Keep-Alive Pings
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Kapazität der ausgehenden Queue
const OUTGOING_QUEUE: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Nachricht vom Relay, in Ankunftsreihenfolge
    Message(IncomingMessage),
}

// ============================================================================
// SENDER SEAM
// ============================================================================

/// Alles, was Signaling-Nachrichten an das Relay abgeben kann.
///
/// `send` blockiert nie; ein Fehler heißt, dass die Nachricht nicht in die
/// Sende-Queue gelangt ist.
pub trait SignalSender: Send + Sync {
    fn send(&self, message: &OutgoingMessage) -> Result<(), SignalingError>;
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    messages_received: u64,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Kommunikation mit dem Relay
pub struct SignalingClient {
    server_url: Url,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<Message>,
}

impl SignalingClient {
    /// Verbindet mit dem Relay.
    ///
    /// Gibt den Client und den Event-Receiver zurück. Events kommen in der
    /// Reihenfolge an, in der das Relay sie geschickt hat.
    pub async fn connect(
        server_url: Url,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), SignalingError> {
        tracing::info!("Connecting to signaling relay: {}", server_url);

        let (ws_stream, _) = connect_async(server_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(OUTGOING_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let state = Arc::new(RwLock::new(ClientState {
            is_connected: true,
            ..Default::default()
        }));

        let _ = event_tx.send(SignalingEvent::Connected);

        // Read-Task
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<IncomingMessage>(&text)
                    {
                        Ok(msg) => {
                            state_clone.write().messages_received += 1;
                            tracing::debug!("Received {}", msg.kind());
                            if event_tx.send(SignalingEvent::Message(msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Ignoring unparseable relay message: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task inkl. Heartbeat
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            loop {
                let outgoing = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = heartbeat.tick() => Message::Ping(Vec::new()),
                };

                if let Err(e) = write.send(outgoing).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            state_clone.write().is_connected = false;
            let _ = write.close().await;
        });

        Ok((
            Self {
                server_url,
                state,
                tx,
            },
            event_rx,
        ))
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Serialisiert und reiht eine Nachricht ein (non-blocking)
    pub fn send_message(&self, message: &OutgoingMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = serde_json::to_string(message)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tracing::debug!("Sending {} to {}", message.kind(), message.target());

        self.tx
            .try_send(Message::Text(text))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl SignalSender for SignalingClient {
    fn send(&self, message: &OutgoingMessage) -> Result<(), SignalingError> {
        self.send_message(message)
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_client(capacity: usize) -> (SignalingClient, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let client = SignalingClient {
            server_url: Url::parse("ws://localhost:8080/ws").unwrap(),
            state: Arc::new(RwLock::new(ClientState {
                is_connected: true,
                ..Default::default()
            })),
            tx,
        };
        (client, rx)
    }

    #[test]
    fn test_send_queues_json_envelope() {
        let (client, mut rx) = offline_client(4);
        client
            .send(&OutgoingMessage::EndCall {
                to: "peer-b".to_string(),
            })
            .unwrap();

        match rx.try_recv().unwrap() {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "end-call");
                assert_eq!(value["payload"]["to"], "peer-b");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_send_fails_when_disconnected() {
        let (client, _rx) = offline_client(4);
        client.state.write().is_connected = false;
        let result = client.send(&OutgoingMessage::RejectCall {
            to: "peer-a".to_string(),
        });
        assert_eq!(result, Err(SignalingError::NotConnected));
    }

    #[test]
    fn test_full_queue_is_a_send_failure() {
        let (client, _rx) = offline_client(1);
        let msg = OutgoingMessage::EndCall {
            to: "peer-b".to_string(),
        };
        client.send(&msg).unwrap();
        assert!(matches!(
            client.send(&msg),
            Err(SignalingError::SendFailed(_))
        ));
    }
}
