//! Track-Ersetzung (Bildschirmfreigabe)
//!
//! Ersetzt den ausgehenden Kamera-Track einer laufenden Video-Session durch
//! einen anderen Video-Track, ohne neue Offer/Answer-Runde. Endet der
//! Ersatz-Track von außen, wird automatisch die Kamera wiederhergestellt.

use super::media::{MediaTrack, TrackKind};
use super::session::{CallState, PeerSession};
use super::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubstitutionError {
    #[error("No connected call")]
    NotConnected,

    #[error("Track substitution is not supported for audio calls")]
    UnsupportedForAudio,

    #[error("Substitute track must be a live video track")]
    InvalidTrack,

    #[error("No camera track to restore")]
    NoCameraTrack,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Aktiver Ersatz-Track einer Session
#[derive(Debug, Default)]
pub struct TrackSubstitution {
    active: Option<MediaTrack>,
}

impl TrackSubstitution {
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&MediaTrack> {
        self.active.as_ref()
    }

    /// Gehört `track_id` zum aktuell aktiven Ersatz?
    pub fn is_current(&self, track_id: &str) -> bool {
        self.active.as_ref().is_some_and(|t| t.id() == track_id)
    }

    fn install(&mut self, track: MediaTrack) {
        if let Some(previous) = self.active.replace(track) {
            previous.stop();
        }
    }

    fn clear(&mut self) -> Option<MediaTrack> {
        self.active.take()
    }

    /// Stoppt den Ersatz-Track, falls vorhanden
    pub fn release(&mut self) {
        if let Some(track) = self.active.take() {
            track.stop();
        }
    }
}

fn check_session(session: &PeerSession) -> Result<(), SubstitutionError> {
    if session.state() != CallState::Connected {
        return Err(SubstitutionError::NotConnected);
    }
    if !session.call_type().has_video() {
        return Err(SubstitutionError::UnsupportedForAudio);
    }
    Ok(())
}

/// Setzt `track` als ausgehendes Video der Session.
///
/// Ein vorher aktiver Ersatz wird gestoppt. Der Kamera-Track bleibt in der
/// Session und wird nicht gestoppt.
pub async fn substitute(
    session: &mut PeerSession,
    track: MediaTrack,
) -> Result<(), SubstitutionError> {
    check_session(session)?;
    if track.kind() != TrackKind::Video || track.is_ended() {
        return Err(SubstitutionError::InvalidTrack);
    }
    let transport = session.transport().ok_or(SubstitutionError::NotConnected)?;

    transport.replace_outgoing_video(&track).await?;
    tracing::info!("Outgoing video of call {} replaced by '{}'", session.id(), track.label());
    session.substitution_mut().install(track);
    Ok(())
}

/// Setzt den ursprünglichen Kamera-Track zurück und stoppt den Ersatz.
///
/// `camera` ist optional der vom Aufrufer übergebene Track; sonst wird der
/// Kamera-Track der Session verwendet.
pub async fn restore(
    session: &mut PeerSession,
    camera: Option<MediaTrack>,
) -> Result<(), SubstitutionError> {
    check_session(session)?;
    let camera = match camera {
        Some(track) => track,
        None => session
            .local_tracks()
            .video()
            .cloned()
            .ok_or(SubstitutionError::NoCameraTrack)?,
    };
    if camera.kind() != TrackKind::Video || camera.is_ended() {
        return Err(SubstitutionError::InvalidTrack);
    }
    let transport = session.transport().ok_or(SubstitutionError::NotConnected)?;

    // Erst austragen, damit das Ende des Ersatz-Tracks nicht als externes
    // Ende gewertet wird
    let substitute = session.substitution_mut().clear();
    let result = transport.replace_outgoing_video(&camera).await;
    if let Some(track) = substitute {
        track.stop();
    }
    result?;

    tracing::info!("Outgoing video of call {} restored to camera", session.id());
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
