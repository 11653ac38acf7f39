//! Media-Akquise und Track-Handles
//!
//! Ein [`MediaTrack`] ist ein Handle auf eine lokale Quelle (Mikrofon,
//! Kamera, Bildschirm). Die Samples selbst fließen am Handle vorbei direkt in
//! den Transport; die Session verwaltet nur Lebenszyklus und Aktivierung.

use crate::signaling::CallType;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Device unavailable: {device} ({reason})")]
    DeviceUnavailable { device: String, reason: String },
}

impl MediaError {
    pub fn busy(device: &str) -> Self {
        Self::DeviceUnavailable {
            device: device.to_string(),
            reason: "busy".to_string(),
        }
    }

    pub fn not_found(device: &str) -> Self {
        Self::DeviceUnavailable {
            device: device.to_string(),
            reason: "not found".to_string(),
        }
    }
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// Handle auf einen lokalen Track. Klone teilen denselben Zustand.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Deaktivierte Tracks senden Stille bzw. Schwarzbild
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Beendet den Track und gibt die Quelle frei. Idempotent.
    pub fn stop(&self) {
        self.inner.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Wartet, bis der Track endet (lokal gestoppt oder von außen beendet)
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Vom Peer empfangener Track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

// ============================================================================
// LOCAL TRACK SET
// ============================================================================

/// Ergebnis einer Akquise: ein Audio-Track, optional ein Kamera-Track
#[derive(Debug, Clone, Default)]
pub struct LocalTrackSet {
    tracks: Vec<MediaTrack>,
}

impl LocalTrackSet {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn video(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn audio(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio().for_each(|t| t.set_enabled(enabled));
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.tracks
            .iter()
            .filter(|t| t.kind() == TrackKind::Video)
            .for_each(|t| t.set_enabled(enabled));
    }

    /// Stoppt alle Tracks und leert das Set
    pub fn release(&mut self) {
        for track in self.tracks.drain(..) {
            track.stop();
        }
    }
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Liefert lokale Tracks für einen Anruf
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Audio-Track, bei `CallType::Video` zusätzlich ein Kamera-Track.
    ///
    /// Schlägt mit [`MediaError::DeviceUnavailable`] fehl, wenn ein Gerät
    /// fehlt, verweigert wird oder belegt ist. Es gibt keine Wiederholung.
    async fn acquire(&self, call_type: CallType) -> Result<LocalTrackSet, MediaError>;
}

/// Mikrofon + Kamera des Geräts, jeweils exklusiv.
///
/// Ein Gerät gilt als belegt, solange ein zuvor ausgegebener Track nicht
/// gestoppt wurde.
pub struct DeviceMediaSource {
    has_microphone: bool,
    has_camera: bool,
    held: Mutex<Vec<MediaTrack>>,
}

impl DeviceMediaSource {
    pub fn new() -> Self {
        Self::with_devices(true, true)
    }

    pub fn with_devices(has_microphone: bool, has_camera: bool) -> Self {
        Self {
            has_microphone,
            has_camera,
            held: Mutex::new(Vec::new()),
        }
    }

    fn is_held(held: &[MediaTrack], kind: TrackKind) -> bool {
        held.iter().any(|t| t.kind() == kind && !t.is_ended())
    }
}

impl Default for DeviceMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for DeviceMediaSource {
    async fn acquire(&self, call_type: CallType) -> Result<LocalTrackSet, MediaError> {
        if !self.has_microphone {
            return Err(MediaError::not_found("microphone"));
        }
        if call_type.has_video() && !self.has_camera {
            return Err(MediaError::not_found("camera"));
        }

        #[cfg(feature = "device-probe")]
        probe_input_device()?;

        let mut held = self.held.lock();
        held.retain(|t| !t.is_ended());

        if Self::is_held(&held, TrackKind::Audio) {
            return Err(MediaError::busy("microphone"));
        }
        if call_type.has_video() && Self::is_held(&held, TrackKind::Video) {
            return Err(MediaError::busy("camera"));
        }

        let mut tracks = vec![MediaTrack::new(TrackKind::Audio, "microphone")];
        if call_type.has_video() {
            tracks.push(MediaTrack::new(TrackKind::Video, "camera"));
        }
        held.extend(tracks.iter().cloned());

        tracing::debug!("Acquired {} local track(s) for {} call", tracks.len(), call_type);
        Ok(LocalTrackSet::new(tracks))
    }
}

/// Prüft über cpal, ob ein Eingabegerät vorhanden ist
#[cfg(feature = "device-probe")]
fn probe_input_device() -> Result<(), MediaError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::not_found("microphone"))?;

    device
        .default_input_config()
        .map_err(|e| MediaError::DeviceUnavailable {
            device: device.name().unwrap_or_else(|_| "microphone".to_string()),
            reason: e.to_string(),
        })?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
