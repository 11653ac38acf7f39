//! Peer Session - Zustand eines einzelnen Anrufs
//!
//! Die Session besitzt exklusiv den Transport, die lokalen und entfernten
//! Tracks und die Candidate-Puffer. Jeder Ausstieg aus dem Zustandsautomaten
//! läuft über [`PeerSession::release`].

use super::ice_buffer::IceCandidateBuffer;
use super::media::{LocalTrackSet, MediaTrack, RemoteTrack};
use super::substitution::TrackSubstitution;
use super::transport::MediaTransport;
use crate::signaling::{CallType, IceCandidate, SessionDescription};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// IDS / ENUMS
// ============================================================================

/// Eindeutige ID eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Kein Anruf
    Idle,
    /// Offer gesendet (oder in Vorbereitung), warte auf Answer
    OutgoingOffer,
    /// Eingehender Anruf wartet auf Annahme
    IncomingOffer,
    /// Anruf aktiv
    Connected,
    /// Anruf beendet, alle Ressourcen freigegeben
    Ended,
}

/// Warum eine Session beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    Replaced,
    DeviceUnavailable,
    NegotiationFailure,
    PeerUnreachable,
    SignalingClosed,
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Eingehender Anruf, wie ihn die UI anzeigt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub from: String,
    pub call_type: CallType,
    /// `false`, solange nur ein `call_request` ohne SDP angekommen ist
    pub has_offer: bool,
}

/// Beobachtbarer Zustand für die UI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub state: CallState,
    pub call_id: Option<CallId>,
    pub role: Option<CallRole>,
    pub peer: Option<String>,
    pub call_type: Option<CallType>,
    #[serde(skip)]
    pub local_tracks: Vec<MediaTrack>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub incoming: Option<IncomingCall>,
    pub signaling_connected: bool,
    pub muted: bool,
    pub video_enabled: bool,
    pub sharing_screen: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl CallSnapshot {
    pub fn idle(signaling_connected: bool) -> Self {
        Self {
            state: CallState::Idle,
            call_id: None,
            role: None,
            peer: None,
            call_type: None,
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
            incoming: None,
            signaling_connected,
            muted: false,
            video_enabled: false,
            sharing_screen: false,
            connected_at: None,
            end_reason: None,
        }
    }
}

// ============================================================================
// PEER SESSION
// ============================================================================

pub struct PeerSession {
    id: CallId,
    role: CallRole,
    peer: String,
    call_type: CallType,
    state: CallState,

    transport: Option<Arc<dyn MediaTransport>>,
    local_tracks: LocalTrackSet,
    remote_tracks: Vec<RemoteTrack>,
    /// Remote-Tracks, die vor `Connected` gemeldet wurden
    early_remote_tracks: Vec<RemoteTrack>,

    pending_remote_candidates: IceCandidateBuffer,
    pending_local_candidates: Vec<IceCandidate>,

    remote_offer: Option<SessionDescription>,
    remote_description_set: bool,
    local_description_sent: bool,
    accepting: bool,

    substitution: TrackSubstitution,
    muted: bool,
    video_enabled: bool,
    connected_at: Option<DateTime<Utc>>,
    end_reason: Option<EndReason>,
}

impl PeerSession {
    fn new(role: CallRole, peer: String, call_type: CallType, state: CallState) -> Self {
        Self {
            id: CallId::new(),
            role,
            peer,
            call_type,
            state,
            transport: None,
            local_tracks: LocalTrackSet::default(),
            remote_tracks: Vec::new(),
            early_remote_tracks: Vec::new(),
            pending_remote_candidates: IceCandidateBuffer::new(),
            pending_local_candidates: Vec::new(),
            remote_offer: None,
            remote_description_set: false,
            local_description_sent: false,
            accepting: false,
            substitution: TrackSubstitution::default(),
            muted: false,
            video_enabled: call_type.has_video(),
            connected_at: None,
            end_reason: None,
        }
    }

    /// Ausgehender Anruf, noch ohne Medien und Transport
    pub fn outgoing(peer: impl Into<String>, call_type: CallType) -> Self {
        Self::new(CallRole::Caller, peer.into(), call_type, CallState::OutgoingOffer)
    }

    /// Eingehender Anruf; der Transport entsteht erst beim Annehmen
    pub fn incoming(
        peer: impl Into<String>,
        call_type: CallType,
        offer: Option<SessionDescription>,
    ) -> Self {
        let mut session =
            Self::new(CallRole::Callee, peer.into(), call_type, CallState::IncomingOffer);
        session.remote_offer = offer;
        session
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Weder `Idle` noch `Ended`
    pub fn is_live(&self) -> bool {
        !matches!(self.state, CallState::Idle | CallState::Ended)
    }

    pub fn transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.transport.clone()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn local_tracks(&self) -> &LocalTrackSet {
        &self.local_tracks
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn pending_local_candidates(&self) -> usize {
        self.pending_local_candidates.len()
    }

    pub fn remote_offer(&self) -> Option<&SessionDescription> {
        self.remote_offer.as_ref()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn local_description_sent(&self) -> bool {
        self.local_description_sent
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn substitution(&self) -> &TrackSubstitution {
        &self.substitution
    }

    pub fn substitution_mut(&mut self) -> &mut TrackSubstitution {
        &mut self.substitution
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// Aktualisiert den gespeicherten Anruf (`call_request` gefolgt von `offer`)
    pub fn refresh_incoming(&mut self, call_type: CallType, offer: Option<SessionDescription>) {
        self.call_type = call_type;
        self.video_enabled = call_type.has_video();
        if offer.is_some() {
            self.remote_offer = offer;
        }
    }

    pub fn set_accepting(&mut self, accepting: bool) {
        self.accepting = accepting;
    }

    /// Übernimmt die akquirierten Tracks; Mute/Kamera-Status wird angewendet
    pub fn set_local_tracks(&mut self, tracks: LocalTrackSet) {
        self.local_tracks = tracks;
        self.local_tracks.set_audio_enabled(!self.muted);
        self.local_tracks.set_video_enabled(self.video_enabled);
    }

    pub fn set_transport(&mut self, transport: Arc<dyn MediaTransport>) {
        self.transport = Some(transport);
    }

    pub fn mark_local_description_sent(&mut self) {
        self.local_description_sent = true;
    }

    pub fn mark_remote_description_set(&mut self) {
        self.remote_description_set = true;
        self.remote_offer = None;
    }

    pub fn mark_connected(&mut self) {
        self.state = CallState::Connected;
        self.accepting = false;
        self.connected_at = Some(Utc::now());
        self.remote_tracks.append(&mut self.early_remote_tracks);
    }

    /// Remote-Tracks sind erst ab `Connected` sichtbar
    pub fn add_remote_track(&mut self, track: RemoteTrack) {
        let known = self
            .remote_tracks
            .iter()
            .chain(self.early_remote_tracks.iter())
            .any(|t| t.id == track.id);
        if known {
            return;
        }
        if self.state == CallState::Connected {
            self.remote_tracks.push(track);
        } else {
            self.early_remote_tracks.push(track);
        }
    }

    /// Übernimmt Candidates, die vor der Session eingetroffen sind
    pub fn adopt_candidates(&mut self, orphans: &mut IceCandidateBuffer) {
        self.pending_remote_candidates.append(orphans);
    }

    pub fn buffer_remote_candidate(&mut self, candidate: IceCandidate) {
        self.pending_remote_candidates.enqueue(candidate);
    }

    /// Wendet gepufferte Remote-Candidates an, sobald die Remote Description
    /// gesetzt ist. Gibt die Anzahl angewendeter Candidates zurück.
    pub async fn drain_remote_candidates(&mut self) -> usize {
        let Some(transport) = self.transport.clone() else {
            return 0;
        };
        if !self.remote_description_set {
            return 0;
        }

        let total = self.pending_remote_candidates.len();
        let failures = self
            .pending_remote_candidates
            .drain_into(transport.as_ref())
            .await;
        for (candidate, e) in &failures {
            tracing::warn!("Failed to apply buffered ICE candidate {:?}: {}", candidate, e);
        }
        total - failures.len()
    }

    pub fn buffer_local_candidate(&mut self, candidate: IceCandidate) {
        self.pending_local_candidates.push(candidate);
    }

    pub fn take_local_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_local_candidates)
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.local_tracks.set_audio_enabled(!muted);
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        self.local_tracks.set_video_enabled(enabled);
    }

    /// Gibt alle Ressourcen frei und setzt `Ended`.
    ///
    /// Stoppt Bildschirm- und lokale Tracks, verwirft Remote-Tracks und
    /// Puffer und schließt den Transport. Mehrfacher Aufruf ist harmlos.
    pub async fn release(&mut self, reason: EndReason) {
        self.substitution.release();
        self.local_tracks.release();
        self.remote_tracks.clear();
        self.early_remote_tracks.clear();
        self.pending_remote_candidates.clear();
        self.pending_local_candidates.clear();
        self.remote_offer = None;
        self.accepting = false;

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!("Failed to close transport for call {}: {}", self.id, e);
            }
        }

        if self.state != CallState::Ended {
            self.end_reason = Some(reason);
        }
        self.state = CallState::Ended;
    }

    pub fn snapshot(&self, signaling_connected: bool) -> CallSnapshot {
        let incoming = (self.state == CallState::IncomingOffer).then(|| IncomingCall {
            from: self.peer.clone(),
            call_type: self.call_type,
            has_offer: self.remote_offer.is_some(),
        });

        CallSnapshot {
            state: self.state,
            call_id: Some(self.id),
            role: Some(self.role),
            peer: Some(self.peer.clone()),
            call_type: Some(self.call_type),
            local_tracks: self.local_tracks.tracks().to_vec(),
            remote_tracks: self.remote_tracks.clone(),
            incoming,
            signaling_connected,
            muted: self.muted,
            video_enabled: self.video_enabled,
            sharing_screen: self.substitution.is_active(),
            connected_at: self.connected_at,
            end_reason: self.end_reason,
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("call_type", &self.call_type)
            .field("state", &self.state)
            .field("has_transport", &self.transport.is_some())
            .field("pending_remote", &self.pending_remote_candidates.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
