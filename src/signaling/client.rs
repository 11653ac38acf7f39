//! WebSocket Client für das Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung einer Identität:
//! - eine Verbindung pro Identität, für alle Anrufe wiederverwendet
//! - Keepalive-Pings gegen Idle-Timeouts
//! - eingehende Envelopes als Stream, Ende des Streams = Verbindung geschlossen
//!
//! Reconnects gibt es nicht: nach dem Schließen muss neu verbunden werden.

use super::channel::{SignalInbound, SignalingError, SignalingSink};
use super::messages::{is_valid_identity, Envelope};
use crate::config::CallConfig;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Größe der ausgehenden Warteschlange
const OUTBOUND_QUEUE: usize = 100;

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    sent: u64,
    received: u64,
}

enum Outbound {
    Text(String),
    Close,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket-Kanal zum Relay für genau eine Identität
pub struct SignalingClient {
    identity: String,
    url: Url,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<Outbound>,
}

impl SignalingClient {
    /// Verbindet `identity` mit dem Relay.
    ///
    /// Gibt den Client (ausgehende Seite) und den Stream der eingehenden
    /// Envelopes zurück.
    pub async fn connect(
        config: &CallConfig,
        identity: &str,
    ) -> Result<(Self, SignalInbound), SignalingError> {
        if !is_valid_identity(identity) {
            return Err(SignalingError::InvalidIdentity(identity.to_string()));
        }

        let url = config
            .signaling_url(identity)
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let state = Arc::new(RwLock::new(ClientState {
            is_connected: true,
            ..Default::default()
        }));

        let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();

        // Read-Task: parst Envelopes und leitet sie weiter
        let state_clone = Arc::clone(&state);
        let own_identity = identity.to_string();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match Envelope::from_json(&text) {
                        Ok(envelope) if envelope.to != own_identity => {
                            tracing::warn!(
                                "Dropping {} addressed to '{}' (we are '{}')",
                                envelope.signal.action(),
                                envelope.to,
                                own_identity
                            );
                        }
                        Ok(envelope) => {
                            state_clone.write().received += 1;
                            if inbound_tx.send(envelope).is_err() {
                                tracing::debug!("Inbound receiver dropped, stopping reader");
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Failed to parse signaling message: {}", e);
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::info!("WebSocket closed by server: {:?}", frame);
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
            tracing::info!("Signaling channel for '{}' closed", own_identity);
        });

        // Write-Task: sendet Nachrichten und Keepalive-Pings
        let state_clone = Arc::clone(&state);
        let keepalive = config.keepalive_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + keepalive,
                keepalive,
            );

            loop {
                tokio::select! {
                    outbound = rx.recv() => match outbound {
                        Some(Outbound::Text(text)) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                tracing::error!("Failed to send WebSocket message: {}", e);
                                break;
                            }
                        }
                        Some(Outbound::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    _ = interval.tick() => {
                        if !state_clone.read().is_connected {
                            break;
                        }
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            tracing::warn!("Keepalive ping failed: {}", e);
                            break;
                        }
                    }
                }
            }

            state_clone.write().is_connected = false;
        });

        let client = Self {
            identity: identity.to_string(),
            url,
            state,
            tx,
        };

        Ok((client, SignalInbound::new(inbound_rx)))
    }

    /// Identität, unter der dieser Kanal registriert ist
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Anzahl gesendeter / empfangener Envelopes
    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.read();
        (state.sent, state.received)
    }

    /// Schließt die Verbindung; der eingehende Stream endet danach.
    pub fn close(&self) {
        if self.tx.try_send(Outbound::Close).is_err() {
            tracing::debug!("Close requested on a channel that is already gone");
        }
        self.state.write().is_connected = false;
    }

    /// Wartet höchstens `timeout`, bis der Kanal geschlossen ist
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

impl SignalingSink for SignalingClient {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = envelope
            .to_json()
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // try_send ist non-blocking
        self.tx
            .try_send(Outbound::Text(text))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        self.state.write().sent += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_connected()
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("identity", &self.identity)
            .field("url", &self.url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
