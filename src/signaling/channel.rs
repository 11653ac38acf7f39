//! Gemeinsame Schnittstelle aller Signaling-Kanäle
//!
//! Ein Kanal gehört genau einer Identität. Ausgehend wird über
//! [`SignalingSink`] gesendet, eingehend liefert [`SignalInbound`] die an die
//! Identität adressierten Envelopes, bis der Kanal geschlossen wird.

use super::messages::Envelope;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid identity '{0}'")]
    InvalidIdentity(String),

    #[error("Identity '{0}' is already connected")]
    AlreadyConnected(String),
}

// ============================================================================
// OUTBOUND
// ============================================================================

/// Ausgehende Seite eines Signaling-Kanals.
///
/// `send` blockiert nie. Ist der Kanal nicht offen, schlägt das Senden mit
/// [`SignalingError::NotConnected`] fehl, statt zu warten.
pub trait SignalingSink: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError>;

    fn is_open(&self) -> bool;
}

// ============================================================================
// INBOUND
// ============================================================================

/// Eingehende Envelopes eines Kanals.
///
/// Endet der Stream, ist der Kanal geschlossen; er wird nicht neu gestartet.
#[derive(Debug)]
pub struct SignalInbound {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl SignalInbound {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { rx }
    }

    /// Wartet auf das nächste Envelope, `None` nach dem Schließen
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl Stream for SignalInbound {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
