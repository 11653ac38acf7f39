//! Abstraktion des Media-Transports (Peer Connection)
//!
//! Die Session spricht nur über [`MediaTransport`] mit der Peer Connection.
//! Callbacks des Transports (ICE, Verbindungsstatus, Remote-Tracks) kommen als
//! [`TransportEvent`] über eine [`TransportEventSink`] zurück und landen in
//! derselben Warteschlange wie alle anderen Eingaben der Engine.

use super::media::{MediaTrack, RemoteTrack};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    Rtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No outgoing video sender")]
    NoVideoSender,

    #[error("Transport is closed")]
    Closed,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Verbindungsstatus der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Zustände, in denen keine Medien mehr fließen
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Lokal gefundener ICE Candidate, muss zum Peer
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(RemoteTrack),
}

/// Rückkanal für Transport-Callbacks
#[derive(Clone)]
pub struct TransportEventSink {
    emit: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportEventSink {
    pub fn new<F>(emit: F) -> Self
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.emit)(event);
    }
}

impl std::fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransportEventSink")
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Eine Peer Connection
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Fügt einen lokalen Track als Sender hinzu
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_local_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Erstellt ein Answer und setzt es als Local Description
    async fn create_local_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Sucht den ausgehenden Video-Sender und tauscht dessen Track aus,
    /// ohne neue Offer/Answer-Runde.
    async fn replace_outgoing_video(&self, track: &MediaTrack) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Erzeugt Peer Connections
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, TransportError>;
}
