//! Test-Doubles für Transport, Media und Signaling

use super::media::{LocalTrackSet, MediaError, MediaSource, MediaTrack, TrackKind};
use super::transport::{
    MediaTransport, TransportError, TransportEvent, TransportEventSink, TransportFactory,
};
use crate::signaling::{
    CallType, Envelope, IceCandidate, SdpKind, SessionDescription, SignalingError, SignalingSink,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    AddTrack(String),
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(IceCandidate),
    ReplaceVideo(String),
    Close,
}

#[derive(Debug, Default, Clone)]
pub struct FakeFailures {
    pub offer: bool,
    pub answer: bool,
    pub remote: bool,
}

pub struct FakeTransport {
    name: String,
    ops: Mutex<Vec<TransportOp>>,
    rejected: Mutex<HashSet<String>>,
    outgoing_video: Mutex<Option<String>>,
    failures: FakeFailures,
    closed: AtomicBool,
    events: Mutex<Option<TransportEventSink>>,
}

impl FakeTransport {
    pub fn new(name: &str) -> Self {
        Self::with_failures(name, FakeFailures::default())
    }

    pub fn with_failures(name: &str, failures: FakeFailures) -> Self {
        Self {
            name: name.to_string(),
            ops: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            outgoing_video: Mutex::new(None),
            failures,
            closed: AtomicBool::new(false),
            events: Mutex::new(None),
        }
    }

    pub fn ops(&self) -> Vec<TransportOp> {
        self.ops.lock().clone()
    }

    /// Erfolgreich hinzugefügte Remote-Candidates in Reihenfolge
    pub fn candidates(&self) -> Vec<IceCandidate> {
        let rejected = self.rejected.lock();
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                TransportOp::AddCandidate(c) if !rejected.contains(&c.candidate) => {
                    Some(c.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.rejected.lock().insert(candidate.to_string());
    }

    pub fn outgoing_video(&self) -> Option<String> {
        self.outgoing_video.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simuliert einen Callback der Peer Connection
    pub fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.events.lock().as_ref() {
            sink.emit(event);
        }
    }

    fn record(&self, op: TransportOp) -> Result<(), TransportError> {
        self.ops.lock().push(op);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        self.record(TransportOp::AddTrack(track.id().to_string()))?;
        if track.kind() == TrackKind::Video {
            *self.outgoing_video.lock() = Some(track.id().to_string());
        }
        Ok(())
    }

    async fn create_local_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(TransportOp::CreateOffer)?;
        if self.failures.offer {
            return Err(TransportError::Rtc("offer failed".to_string()));
        }
        Ok(SessionDescription::offer(format!("offer-from-{}", self.name)))
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(TransportOp::CreateAnswer)?;
        if self.failures.answer {
            return Err(TransportError::Rtc("answer failed".to_string()));
        }
        Ok(SessionDescription::answer(format!("answer-from-{}", self.name)))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(TransportOp::SetRemote(description.kind))?;
        if self.failures.remote {
            return Err(TransportError::InvalidSdp("rejected".to_string()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let rejected = self.rejected.lock().contains(&candidate.candidate);
        self.record(TransportOp::AddCandidate(candidate))?;
        if rejected {
            return Err(TransportError::Rtc("candidate rejected".to_string()));
        }
        Ok(())
    }

    async fn replace_outgoing_video(&self, track: &MediaTrack) -> Result<(), TransportError> {
        self.record(TransportOp::ReplaceVideo(track.id().to_string()))?;
        let mut outgoing = self.outgoing_video.lock();
        if outgoing.is_none() {
            return Err(TransportError::NoVideoSender);
        }
        *outgoing = Some(track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.ops.lock().push(TransportOp::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Erzeugt [`FakeTransport`]s und merkt sich alle erzeugten
pub struct FakeTransportFactory {
    name: String,
    failures: Mutex<FakeFailures>,
    created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeTransportFactory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failures: Mutex::new(FakeFailures::default()),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Gilt für alle danach erzeugten Transports
    pub fn set_failures(&self, failures: FakeFailures) {
        *self.failures.lock() = failures;
    }

    pub fn created(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let failures = self.failures.lock().clone();
        let transport = Arc::new(FakeTransport::with_failures(&self.name, failures));
        *transport.events.lock() = Some(events);
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ============================================================================
// MEDIA
// ============================================================================

/// Media-Quelle mit steuerbarem Fehler und optionaler Sperre.
///
/// Im gesperrten Modus wartet jede Akquise auf [`FakeMediaSource::release_one`].
pub struct FakeMediaSource {
    failure: Mutex<Option<MediaError>>,
    gated: AtomicBool,
    gate: Semaphore,
    started: watch::Sender<usize>,
    issued: Mutex<Vec<MediaTrack>>,
    calls: AtomicUsize,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        let (started, _) = watch::channel(0);
        Self {
            failure: Mutex::new(None),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            started,
            issued: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn gated() -> Self {
        let source = Self::new();
        source.gated.store(true, Ordering::SeqCst);
        source
    }

    pub fn fail_with(&self, error: Option<MediaError>) {
        *self.failure.lock() = error;
    }

    pub fn release_one(&self) {
        self.gate.add_permits(1);
    }

    /// Wartet, bis mindestens `n` Akquisen begonnen haben
    pub async fn wait_started(&self, n: usize) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    pub fn issued(&self) -> Vec<MediaTrack> {
        self.issued.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, call_type: CallType) -> Result<LocalTrackSet, MediaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.send_modify(|count| *count += 1);

        if self.gated.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }

        let mut tracks = vec![MediaTrack::new(TrackKind::Audio, "microphone")];
        if call_type.has_video() {
            tracks.push(MediaTrack::new(TrackKind::Video, "camera"));
        }
        self.issued.lock().extend(tracks.iter().cloned());
        Ok(LocalTrackSet::new(tracks))
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

/// Sink, der alle gesendeten Envelopes aufzeichnet
pub struct RecordingSink {
    open: AtomicBool,
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|e| e.signal.action()).collect()
    }
}

impl SignalingSink for RecordingSink {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(envelope);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
