//! Call Engine
//!
//! Ein einzelner Worker-Task besitzt die aktive [`PeerSession`] und
//! verarbeitet alle Eingaben nacheinander aus einer Warteschlange: UI-Intents,
//! eingehende Envelopes, Transport-Callbacks und interne Timer.
//!
//! Langlaufende Schritte (Media-Akquise, Offer/Answer, Remote Description)
//! laufen über `CallWorker::suspend`. Während ein Schritt läuft, werden
//! `hang_up()`, `call_end` des Peers und das Schließen des Signaling-Kanals
//! sofort angewendet; alle anderen Eingaben warten in Ankunftsreihenfolge.
//! Ein Schritt, dessen Session inzwischen beendet wurde, verwirft sein
//! Ergebnis und gibt neu belegte Ressourcen frei.

use super::ice_buffer::{IceCandidateBuffer, OrphanCandidates};
use super::media::{MediaError, MediaSource, MediaTrack, RemoteTrack};
use super::session::{CallId, CallSnapshot, CallState, EndReason, PeerSession};
use super::substitution::{self, SubstitutionError};
use super::transport::{
    MediaTransport, TransportError, TransportEvent, TransportEventSink, TransportFactory,
};
use crate::config::CallConfig;
use crate::signaling::{
    is_valid_identity, CallType, Envelope, IceCandidate, SdpKind, SessionDescription, Signal,
    SignalInbound, SignalingSink,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Signaling channel is not open")]
    TransportUnavailable,

    #[error(transparent)]
    DeviceUnavailable(#[from] MediaError),

    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("Peer unreachable")]
    PeerUnreachable,

    #[error("'{0}' called while another call is active")]
    GlareConflict(String),

    #[error("No active call")]
    NoActiveCall,

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("Incoming call has no offer yet")]
    OfferNotReceived,

    #[error("Operation not allowed in current call state")]
    InvalidState,

    #[error("Not supported for audio calls")]
    UnsupportedForAudio,

    #[error("Track is not a live video track")]
    InvalidTrack,

    #[error("Invalid peer identity '{0}'")]
    InvalidPeer(String),

    #[error("Call was ended before the operation completed")]
    Cancelled,

    #[error("Call engine stopped")]
    EngineStopped,
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        CallError::NegotiationFailure(e.to_string())
    }
}

impl From<SubstitutionError> for CallError {
    fn from(e: SubstitutionError) -> Self {
        match e {
            SubstitutionError::NotConnected => CallError::InvalidState,
            SubstitutionError::UnsupportedForAudio => CallError::UnsupportedForAudio,
            SubstitutionError::InvalidTrack | SubstitutionError::NoCameraTrack => {
                CallError::InvalidTrack
            }
            SubstitutionError::Transport(e) => e.into(),
        }
    }
}

// ============================================================================
// EVENTS / SETTINGS
// ============================================================================

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    IncomingCall { from: String, call_type: CallType },
    RemoteTrack(RemoteTrack),
    Ended {
        call_id: CallId,
        peer: String,
        reason: EndReason,
    },
    /// Fehler ohne wartenden Aufrufer (z.B. abgewiesenes Glare-Offer)
    Error(CallError),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Wie lange `Ended` sichtbar bleibt, bevor die Engine zu `Idle` wechselt
    pub ended_linger: Duration,
    /// Obergrenzen für Candidates von Absendern ohne Session
    pub max_orphan_senders: usize,
    pub max_orphan_candidates: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ended_linger: Duration::from_millis(500),
            max_orphan_senders: OrphanCandidates::DEFAULT_MAX_SENDERS,
            max_orphan_candidates: OrphanCandidates::DEFAULT_MAX_PER_SENDER,
        }
    }
}

impl From<&CallConfig> for EngineSettings {
    fn from(config: &CallConfig) -> Self {
        Self {
            ended_linger: config.ended_linger(),
            ..Self::default()
        }
    }
}

// ============================================================================
// INPUT QUEUE
// ============================================================================

type Reply = oneshot::Sender<Result<(), CallError>>;

#[derive(Debug)]
enum Intent {
    StartCall { peer: String, call_type: CallType },
    Accept,
    Reject,
    HangUp,
    Substitute(MediaTrack),
    Restore(MediaTrack),
    SetMuted(bool),
    SetVideoEnabled(bool),
    /// Barriere: antwortet, sobald alle vorherigen Eingaben verarbeitet sind
    Sync,
}

#[derive(Debug)]
enum Input {
    Intent(Intent, Reply),
    Signal(Envelope),
    Transport { call: CallId, event: TransportEvent },
    SubstituteEnded { call: CallId, track_id: String },
    SignalingClosed,
    Linger { call: CallId },
}

/// Ausgang eines unterbrechbaren Schritts
enum Step<T> {
    Done(T),
    /// Die Session wurde während des Schritts beendet oder ersetzt
    Abandoned(T),
}

// ============================================================================
// CALL ENGINE (HANDLE)
// ============================================================================

/// Handle auf den Worker einer Identität. Klone teilen denselben Worker; er
/// endet, wenn der letzte Handle fallen gelassen wird.
#[derive(Clone)]
pub struct CallEngine {
    identity: Arc<str>,
    tx: mpsc::UnboundedSender<Input>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallEngine {
    /// Startet den Worker für `identity`
    pub fn spawn(
        identity: &str,
        sink: Arc<dyn SignalingSink>,
        media: Arc<dyn MediaSource>,
        transports: Arc<dyn TransportFactory>,
        settings: EngineSettings,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::idle(sink.is_open()));
        let (events, _) = broadcast::channel(100);

        let orphans =
            OrphanCandidates::new(settings.max_orphan_senders, settings.max_orphan_candidates);
        let worker = CallWorker {
            identity: identity.to_string(),
            sink,
            media,
            transports,
            settings,
            session: None,
            orphans,
            ended_peer: None,
            signaling_closed: false,
            inputs: rx,
            loopback: tx.downgrade(),
            deferred: VecDeque::new(),
            snapshot: snapshot_tx,
            events: events.clone(),
        };
        tokio::spawn(worker.run());

        tracing::info!("Call engine started for '{}'", identity);

        Self {
            identity: Arc::from(identity),
            tx,
            snapshot: snapshot_rx,
            events,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    // ========================================================================
    // SIGNALING INPUT
    // ========================================================================

    /// Reiht ein eingehendes Envelope ein
    pub fn deliver(&self, envelope: Envelope) -> Result<(), CallError> {
        self.tx
            .send(Input::Signal(envelope))
            .map_err(|_| CallError::EngineStopped)
    }

    /// Meldet, dass der Signaling-Kanal geschlossen wurde
    pub fn signaling_closed(&self) -> Result<(), CallError> {
        self.tx
            .send(Input::SignalingClosed)
            .map_err(|_| CallError::EngineStopped)
    }

    /// Leitet alle Envelopes aus `inbound` an die Engine weiter und meldet
    /// das Ende des Streams als geschlossenen Kanal.
    pub fn pump(&self, inbound: SignalInbound) -> JoinHandle<()> {
        self.pump_with(inbound, |_| {})
    }

    /// Wie [`CallEngine::pump`], ruft aber vorher `inspect` für jedes
    /// Envelope auf
    pub fn pump_with<F>(&self, mut inbound: SignalInbound, inspect: F) -> JoinHandle<()>
    where
        F: Fn(&Envelope) + Send + 'static,
    {
        let tx = self.tx.downgrade();
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                inspect(&envelope);
                let Some(tx) = tx.upgrade() else {
                    return;
                };
                if tx.send(Input::Signal(envelope)).is_err() {
                    return;
                }
            }

            tracing::info!("Signaling inbound stream ended");
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Input::SignalingClosed);
            }
        })
    }

    // ========================================================================
    // INTENTS
    // ========================================================================

    async fn request(&self, intent: Intent) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Input::Intent(intent, reply))
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)?
    }

    /// Ruft `peer` an. Eine bestehende Session wird vorher beendet.
    pub async fn start_call(&self, peer: &str, call_type: CallType) -> Result<(), CallError> {
        self.request(Intent::StartCall {
            peer: peer.to_string(),
            call_type,
        })
        .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(Intent::Accept).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(Intent::Reject).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(Intent::HangUp).await
    }

    /// Ersetzt das ausgehende Video (z.B. durch eine Bildschirmaufnahme)
    pub async fn substitute_outgoing_video(&self, track: MediaTrack) -> Result<(), CallError> {
        self.request(Intent::Substitute(track)).await
    }

    pub async fn restore_outgoing_video(&self, track: MediaTrack) -> Result<(), CallError> {
        self.request(Intent::Restore(track)).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(Intent::SetMuted(muted)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(Intent::SetVideoEnabled(enabled)).await
    }

    /// Wartet, bis alle bisher eingereihten Eingaben verarbeitet sind
    pub async fn sync(&self) -> Result<(), CallError> {
        self.request(Intent::Sync).await
    }

    // ========================================================================
    // OBSERVERS
    // ========================================================================

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Wartet, bis der Snapshot `predicate` erfüllt. `false` bei Timeout.
    pub async fn wait_until<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: FnMut(&CallSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let reached = tokio::time::timeout(timeout, rx.wait_for(predicate)).await;
        matches!(reached, Ok(Ok(_)))
    }
}

// ============================================================================
// CALL WORKER
// ============================================================================

struct CallWorker {
    identity: String,
    sink: Arc<dyn SignalingSink>,
    media: Arc<dyn MediaSource>,
    transports: Arc<dyn TransportFactory>,
    settings: EngineSettings,

    session: Option<PeerSession>,
    /// ICE Candidates von Absendern ohne Session
    orphans: OrphanCandidates,
    /// Peer der zuletzt beendeten Session; dessen späte Candidates verfallen
    ended_peer: Option<String>,
    signaling_closed: bool,

    inputs: mpsc::UnboundedReceiver<Input>,
    loopback: mpsc::WeakUnboundedSender<Input>,
    deferred: VecDeque<Input>,

    snapshot: watch::Sender<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallWorker {
    async fn run(mut self) {
        loop {
            let input = match self.deferred.pop_front() {
                Some(input) => input,
                None => match self.inputs.recv().await {
                    Some(input) => input,
                    None => break,
                },
            };
            self.handle(input).await;
            self.publish();
        }

        if self.has_live_session() {
            self.end_session(EndReason::LocalHangup, true).await;
        }
        tracing::info!("Call engine for '{}' stopped", self.identity);
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Intent(intent, reply) => {
                let result = self.on_intent(intent).await;
                self.publish();
                let _ = reply.send(result);
            }
            Input::Signal(envelope) => self.on_signal(envelope).await,
            Input::Transport { call, event } => self.on_transport_event(call, event).await,
            Input::SubstituteEnded { call, track_id } => {
                self.on_substitute_ended(call, track_id).await
            }
            Input::SignalingClosed => self.on_signaling_closed().await,
            Input::Linger { call } => self.on_linger(call),
        }
    }

    async fn on_intent(&mut self, intent: Intent) -> Result<(), CallError> {
        match intent {
            Intent::StartCall { peer, call_type } => self.start_call(peer, call_type).await,
            Intent::Accept => self.accept_call().await,
            Intent::Reject => self.reject_call().await,
            Intent::HangUp => self.hang_up().await,
            Intent::Substitute(track) => self.substitute(track).await,
            Intent::Restore(track) => self.restore(track).await,
            Intent::SetMuted(muted) => {
                let session = self.live_session_mut().ok_or(CallError::NoActiveCall)?;
                session.set_muted(muted);
                tracing::debug!("Microphone {}", if muted { "muted" } else { "unmuted" });
                Ok(())
            }
            Intent::SetVideoEnabled(enabled) => {
                let session = self.live_session_mut().ok_or(CallError::NoActiveCall)?;
                session.set_video_enabled(enabled);
                tracing::debug!("Camera {}", if enabled { "enabled" } else { "disabled" });
                Ok(())
            }
            Intent::Sync => Ok(()),
        }
    }

    // ========================================================================
    // SUSPENSION
    // ========================================================================

    /// Führt einen langlaufenden Schritt der Session `call` aus.
    ///
    /// Währenddessen werden abbrechende Eingaben sofort verarbeitet, alle
    /// anderen zurückgestellt. `fut` darf `self` nicht borgen.
    async fn suspend<T, F>(&mut self, call: CallId, fut: F) -> Step<T>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(fut);
        let mut inputs_open = true;
        let mut abandoned = false;

        loop {
            tokio::select! {
                biased;

                output = &mut fut => {
                    return if abandoned || !self.is_current(call) {
                        Step::Abandoned(output)
                    } else {
                        Step::Done(output)
                    };
                }

                input = self.inputs.recv(), if inputs_open => match input {
                    Some(input) if self.is_cancelling(&input) => {
                        self.interrupt(input).await;
                        self.publish();
                        if !self.is_current(call) {
                            abandoned = true;
                        }
                    }
                    Some(input) => self.deferred.push_back(input),
                    None => inputs_open = false,
                },
            }
        }
    }

    fn is_cancelling(&self, input: &Input) -> bool {
        match input {
            Input::Intent(Intent::HangUp, _) | Input::SignalingClosed => true,
            Input::Signal(envelope) => {
                matches!(envelope.signal, Signal::CallEnd)
                    && self
                        .session
                        .as_ref()
                        .is_some_and(|s| s.is_live() && s.peer() == envelope.from)
            }
            _ => false,
        }
    }

    /// Verarbeitet eine abbrechende Eingabe, ohne selbst zu suspendieren
    async fn interrupt(&mut self, input: Input) {
        match input {
            Input::Intent(Intent::HangUp, reply) => {
                let result = self.hang_up().await;
                self.publish();
                let _ = reply.send(result);
            }
            Input::Signal(envelope) => self.on_call_end(&envelope.from).await,
            Input::SignalingClosed => self.on_signaling_closed().await,
            other => self.deferred.push_back(other),
        }
    }

    /// Fehler für einen Intent, dessen Session während eines Schritts endete
    fn abandoned_error(&self, call: CallId) -> CallError {
        let reason = self
            .session
            .as_ref()
            .filter(|s| s.id() == call)
            .and_then(|s| s.end_reason());
        match reason {
            Some(EndReason::SignalingClosed) => CallError::TransportUnavailable,
            Some(EndReason::PeerUnreachable) => CallError::PeerUnreachable,
            _ => CallError::Cancelled,
        }
    }

    // ========================================================================
    // SESSION HELPERS
    // ========================================================================

    fn has_live_session(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_live())
    }

    fn live_session_mut(&mut self) -> Option<&mut PeerSession> {
        self.session.as_mut().filter(|s| s.is_live())
    }

    /// Ist `call` noch die aktive, nicht beendete Session?
    fn is_current(&self, call: CallId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.id() == call && s.is_live())
    }

    fn current_mut(&mut self, call: CallId) -> Option<&mut PeerSession> {
        self.session
            .as_mut()
            .filter(|s| s.id() == call && s.is_live())
    }

    fn signaling_open(&self) -> bool {
        !self.signaling_closed && self.sink.is_open()
    }

    fn send(&self, to: &str, signal: Signal) -> Result<(), CallError> {
        let action = signal.action();
        self.sink
            .send(Envelope::new(self.identity.as_str(), to, signal))
            .map_err(|e| {
                tracing::warn!("Failed to send {} to {}: {}", action, to, e);
                CallError::TransportUnavailable
            })
    }

    fn transport_sink(&self, call: CallId) -> TransportEventSink {
        let tx = self.loopback.clone();
        TransportEventSink::new(move |event| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Input::Transport { call, event });
            }
        })
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let snapshot = match &self.session {
            Some(session) => session.snapshot(self.signaling_open()),
            None => CallSnapshot::idle(self.signaling_open()),
        };
        let state = snapshot.state;
        let previous = self.snapshot.send_replace(snapshot);
        if previous.state != state {
            tracing::debug!("Call state: {:?} -> {:?}", previous.state, state);
            self.emit(CallEvent::StateChanged(state));
        }
    }

    /// Beendet die aktive Session und gibt alle Ressourcen frei.
    ///
    /// Mit `notify` wird dem Peer vorher `call_end` gesendet (best effort).
    async fn end_session(&mut self, reason: EndReason, notify: bool) {
        let Some(session) = self.session.as_mut().filter(|s| s.is_live()) else {
            return;
        };
        let call = session.id();
        let peer = session.peer().to_string();

        if notify && self.sink.is_open() && !self.signaling_closed {
            let _ = self
                .sink
                .send(Envelope::new(self.identity.as_str(), peer.as_str(), Signal::CallEnd))
                .map_err(|e| tracing::warn!("Failed to notify {} about call end: {}", peer, e));
        }

        session.release(reason).await;
        tracing::info!("Call {} with {} ended: {:?}", call, peer, reason);
        self.forget_peer(&peer);

        self.emit(CallEvent::Ended {
            call_id: call,
            peer,
            reason,
        });
        self.publish();
        self.schedule_linger(call);
    }

    fn schedule_linger(&self, call: CallId) {
        let tx = self.loopback.clone();
        let linger = self.settings.ended_linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Input::Linger { call });
            }
        });
    }

    fn on_linger(&mut self, call: CallId) {
        let ended = self
            .session
            .as_ref()
            .is_some_and(|s| s.id() == call && s.state() == CallState::Ended);
        if ended {
            self.session = None;
        }
    }

    /// Übernimmt Candidates, die vor der Session von `peer` eintrafen
    fn take_orphans(&mut self, peer: &str) -> Option<IceCandidateBuffer> {
        if self.ended_peer.as_deref() == Some(peer) {
            self.ended_peer = None;
        }
        self.orphans.take(peer)
    }

    /// Nach dem Ende einer Session mit `peer` gehören dessen Candidates zu
    /// keinem Anruf mehr
    fn forget_peer(&mut self, peer: &str) {
        self.orphans.discard(peer);
        self.ended_peer = Some(peer.to_string());
    }

    /// Sendet lokal gesammelte Candidates nach dem eigenen Offer/Answer
    fn flush_local_candidates(&mut self, call: CallId) {
        let Some(session) = self.current_mut(call) else {
            return;
        };
        let peer = session.peer().to_string();
        for candidate in session.take_local_candidates() {
            let _ = self.send(&peer, Signal::IceCandidate { candidate });
        }
    }

    // ========================================================================
    // SHARED NEGOTIATION STEPS
    // ========================================================================

    /// Akquiriert lokale Medien für `call`. Bei Fehler ist die Session beendet.
    async fn acquire_media(&mut self, call: CallId, call_type: CallType) -> Result<(), CallError> {
        let media = Arc::clone(&self.media);
        match self.suspend(call, async move { media.acquire(call_type).await }).await {
            Step::Done(Ok(tracks)) => {
                if let Some(session) = self.current_mut(call) {
                    session.set_local_tracks(tracks);
                }
                Ok(())
            }
            Step::Done(Err(e)) => {
                tracing::error!("Media acquisition failed: {}", e);
                self.end_session(EndReason::DeviceUnavailable, true).await;
                Err(e.into())
            }
            Step::Abandoned(result) => {
                if let Ok(mut tracks) = result {
                    tracing::debug!("Discarding {} late track(s)", tracks.len());
                    tracks.release();
                }
                Err(self.abandoned_error(call))
            }
        }
    }

    /// Erstellt den Transport und hängt die lokalen Tracks an
    async fn create_transport(
        &mut self,
        call: CallId,
    ) -> Result<Arc<dyn MediaTransport>, CallError> {
        let factory = Arc::clone(&self.transports);
        let sink = self.transport_sink(call);

        let transport = match self.suspend(call, async move { factory.create(sink).await }).await {
            Step::Done(Ok(transport)) => transport,
            Step::Done(Err(e)) => return Err(self.negotiation_failed(e).await),
            Step::Abandoned(result) => {
                if let Ok(transport) = result {
                    let _ = transport.close().await;
                }
                return Err(self.abandoned_error(call));
            }
        };

        let tracks: Vec<MediaTrack> = match self.current_mut(call) {
            Some(session) => {
                session.set_transport(Arc::clone(&transport));
                session.local_tracks().tracks().to_vec()
            }
            None => {
                let _ = transport.close().await;
                return Err(self.abandoned_error(call));
            }
        };

        for track in &tracks {
            if let Err(e) = transport.add_local_track(track).await {
                return Err(self.negotiation_failed(e).await);
            }
        }
        Ok(transport)
    }

    async fn negotiation_failed(&mut self, e: TransportError) -> CallError {
        tracing::error!("Negotiation failed: {}", e);
        self.end_session(EndReason::NegotiationFailure, true).await;
        e.into()
    }

    /// Setzt die Remote Description und wendet gepufferte Candidates an
    async fn apply_remote_description(
        &mut self,
        call: CallId,
        transport: Arc<dyn MediaTransport>,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        let step = self
            .suspend(call, async move {
                transport.set_remote_description(description).await
            })
            .await;
        match step {
            Step::Done(Ok(())) => {}
            Step::Done(Err(e)) => return Err(self.negotiation_failed(e).await),
            Step::Abandoned(_) => return Err(self.abandoned_error(call)),
        }

        let Some(session) = self.current_mut(call) else {
            return Err(self.abandoned_error(call));
        };
        session.mark_remote_description_set();
        let applied = session.drain_remote_candidates().await;
        if applied > 0 {
            tracing::debug!("Applied {} buffered ICE candidate(s)", applied);
        }
        Ok(())
    }

    // ========================================================================
    // INTENT HANDLERS
    // ========================================================================

    async fn start_call(&mut self, peer: String, call_type: CallType) -> Result<(), CallError> {
        if !is_valid_identity(&peer) || peer == self.identity {
            return Err(CallError::InvalidPeer(peer));
        }
        if !self.signaling_open() {
            return Err(CallError::TransportUnavailable);
        }

        if self.has_live_session() {
            tracing::info!("Replacing active call by new call to {}", peer);
            self.end_session(EndReason::Replaced, true).await;
        }

        let mut session = PeerSession::outgoing(peer.as_str(), call_type);
        if let Some(mut orphans) = self.take_orphans(&peer) {
            session.adopt_candidates(&mut orphans);
        }
        let call = session.id();
        self.session = Some(session);
        self.publish();
        tracing::info!("Calling {} ({} call {})", peer, call_type, call);

        self.acquire_media(call, call_type).await?;
        let transport = self.create_transport(call).await?;

        let offer = {
            let transport = Arc::clone(&transport);
            match self
                .suspend(call, async move { transport.create_local_offer().await })
                .await
            {
                Step::Done(Ok(offer)) => offer,
                Step::Done(Err(e)) => return Err(self.negotiation_failed(e).await),
                Step::Abandoned(_) => return Err(self.abandoned_error(call)),
            }
        };

        if let Err(e) = self.send(&peer, Signal::Offer { sdp: offer, call_type }) {
            self.end_session(EndReason::SignalingClosed, false).await;
            return Err(e);
        }
        if let Some(session) = self.current_mut(call) {
            session.mark_local_description_sent();
        }
        self.flush_local_candidates(call);

        tracing::info!("Offer sent to {}", peer);
        Ok(())
    }

    async fn accept_call(&mut self) -> Result<(), CallError> {
        let session = self
            .session
            .as_mut()
            .filter(|s| s.state() == CallState::IncomingOffer && !s.is_accepting())
            .ok_or(CallError::NoIncomingCall)?;
        let offer = session
            .remote_offer()
            .cloned()
            .ok_or(CallError::OfferNotReceived)?;
        if !(self.sink.is_open() && !self.signaling_closed) {
            return Err(CallError::TransportUnavailable);
        }

        session.set_accepting(true);
        let call = session.id();
        let peer = session.peer().to_string();
        let call_type = session.call_type();
        tracing::info!("Accepting {} call {} from {}", call_type, call, peer);

        self.acquire_media(call, call_type).await?;
        let transport = self.create_transport(call).await?;
        self.apply_remote_description(call, Arc::clone(&transport), offer)
            .await?;

        let answer = match self
            .suspend(call, async move { transport.create_local_answer().await })
            .await
        {
            Step::Done(Ok(answer)) => answer,
            Step::Done(Err(e)) => return Err(self.negotiation_failed(e).await),
            Step::Abandoned(_) => return Err(self.abandoned_error(call)),
        };

        if let Err(e) = self.send(&peer, Signal::Answer { sdp: answer }) {
            self.end_session(EndReason::SignalingClosed, false).await;
            return Err(e);
        }
        if let Some(session) = self.current_mut(call) {
            session.mark_local_description_sent();
            session.mark_connected();
        }
        self.flush_local_candidates(call);
        self.publish();

        tracing::info!("Call {} with {} connected", call, peer);
        Ok(())
    }

    async fn reject_call(&mut self) -> Result<(), CallError> {
        let session = self
            .session
            .as_ref()
            .filter(|s| s.state() == CallState::IncomingOffer && !s.is_accepting())
            .ok_or(CallError::NoIncomingCall)?;
        if !self.signaling_open() {
            return Err(CallError::TransportUnavailable);
        }

        let peer = session.peer().to_string();
        let call = session.id();
        self.send(&peer, Signal::CallEnd)?;

        if let Some(mut session) = self.session.take() {
            session.release(EndReason::Rejected).await;
        }
        self.forget_peer(&peer);
        tracing::info!("Rejected call {} from {}", call, peer);
        self.emit(CallEvent::Ended {
            call_id: call,
            peer,
            reason: EndReason::Rejected,
        });
        Ok(())
    }

    async fn hang_up(&mut self) -> Result<(), CallError> {
        if !self.has_live_session() {
            return Err(CallError::NoActiveCall);
        }
        self.end_session(EndReason::LocalHangup, true).await;
        Ok(())
    }

    async fn substitute(&mut self, track: MediaTrack) -> Result<(), CallError> {
        let session = self.live_session_mut().ok_or(CallError::NoActiveCall)?;
        substitution::substitute(session, track.clone()).await?;

        let call = session.id();
        let tx = self.loopback.clone();
        tokio::spawn(async move {
            track.ended().await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Input::SubstituteEnded {
                    call,
                    track_id: track.id().to_string(),
                });
            }
        });
        Ok(())
    }

    async fn restore(&mut self, track: MediaTrack) -> Result<(), CallError> {
        let session = self.live_session_mut().ok_or(CallError::NoActiveCall)?;
        substitution::restore(session, Some(track)).await?;
        Ok(())
    }

    // ========================================================================
    // SIGNALING HANDLERS
    // ========================================================================

    async fn on_signal(&mut self, envelope: Envelope) {
        if envelope.to != self.identity {
            tracing::warn!(
                "Dropping {} addressed to '{}'",
                envelope.signal.action(),
                envelope.to
            );
            return;
        }
        if envelope.from == self.identity || !is_valid_identity(&envelope.from) {
            tracing::warn!("Dropping {} from '{}'", envelope.signal.action(), envelope.from);
            return;
        }

        let from = envelope.from;
        match envelope.signal {
            Signal::CallRequest { call_type } => self.on_incoming(from, call_type, None).await,
            Signal::Offer { sdp, call_type } => {
                if sdp.kind != SdpKind::Offer {
                    tracing::warn!("Ignoring offer from {} with {:?} description", from, sdp.kind);
                    return;
                }
                self.on_incoming(from, call_type, Some(sdp)).await
            }
            Signal::Answer { sdp } => self.on_answer(from, sdp).await,
            Signal::IceCandidate { candidate } => self.on_remote_candidate(from, candidate).await,
            Signal::CallEnd => self.on_call_end(&from).await,
        }
    }

    async fn on_incoming(
        &mut self,
        from: String,
        call_type: CallType,
        offer: Option<SessionDescription>,
    ) {
        if let Some(session) = self.live_session_mut() {
            if session.peer() == from {
                match session.state() {
                    CallState::IncomingOffer if !session.is_accepting() => {
                        tracing::debug!("Updating incoming call from {}", from);
                        session.refresh_incoming(call_type, offer);
                        return;
                    }
                    CallState::IncomingOffer | CallState::Connected => {
                        tracing::warn!("Ignoring repeated offer from {}", from);
                        return;
                    }
                    _ => {}
                }
            }

            let error = CallError::GlareConflict(from.clone());
            tracing::warn!("{}; rejecting", error);
            self.orphans.discard(&from);
            let _ = self.send(&from, Signal::CallEnd);
            self.emit(CallEvent::Error(error));
            return;
        }

        let mut session = PeerSession::incoming(from.as_str(), call_type, offer);
        if let Some(mut orphans) = self.take_orphans(&from) {
            session.adopt_candidates(&mut orphans);
        }
        tracing::info!("Incoming {} call {} from {}", call_type, session.id(), from);
        self.session = Some(session);
        self.emit(CallEvent::IncomingCall { from, call_type });
    }

    async fn on_answer(&mut self, from: String, sdp: SessionDescription) {
        let expected = self.session.as_ref().filter(|s| {
            s.is_live()
                && s.peer() == from
                && s.state() == CallState::OutgoingOffer
                && s.local_description_sent()
                && !s.remote_description_set()
        });
        let (Some(session), SdpKind::Answer) = (expected, sdp.kind) else {
            tracing::warn!("Ignoring unexpected answer from {}", from);
            return;
        };
        let Some(transport) = session.transport() else {
            tracing::warn!("Ignoring answer from {}: no transport", from);
            return;
        };
        let call = session.id();

        match self.apply_remote_description(call, transport, sdp).await {
            Ok(()) => {
                if let Some(session) = self.current_mut(call) {
                    session.mark_connected();
                }
                tracing::info!("Call {} with {} connected", call, from);
            }
            Err(CallError::Cancelled) => {}
            Err(e) => self.emit(CallEvent::Error(e)),
        }
    }

    async fn on_remote_candidate(&mut self, from: String, candidate: IceCandidate) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.is_live() && s.peer() == from)
        else {
            if self.ended_peer.as_deref() == Some(from.as_str()) {
                tracing::debug!("Dropping late ICE candidate from {} of ended call", from);
                return;
            }
            tracing::debug!("Buffering ICE candidate from {} without session", from);
            self.orphans.enqueue(&from, candidate);
            return;
        };

        match session.transport() {
            Some(transport) if session.remote_description_set() => {
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    tracing::warn!("Failed to add ICE candidate from {}: {}", from, e);
                }
            }
            _ => {
                session.buffer_remote_candidate(candidate);
                tracing::debug!(
                    "Buffered ICE candidate from {} ({} pending)",
                    from,
                    session.pending_remote_candidates()
                );
            }
        }
    }

    async fn on_call_end(&mut self, from: &str) {
        let is_peer = self
            .session
            .as_ref()
            .is_some_and(|s| s.is_live() && s.peer() == from);
        if is_peer {
            self.end_session(EndReason::RemoteHangup, false).await;
        } else if self.orphans.discard(from) {
            tracing::debug!("Discarded buffered ICE candidates from {}", from);
        } else {
            tracing::debug!("Ignoring call_end from {} without session", from);
        }
    }

    async fn on_signaling_closed(&mut self) {
        if self.signaling_closed {
            return;
        }
        tracing::warn!("Signaling channel closed");
        self.signaling_closed = true;
        self.orphans.clear();
        self.end_session(EndReason::SignalingClosed, false).await;
    }

    // ========================================================================
    // TRANSPORT HANDLERS
    // ========================================================================

    async fn on_transport_event(&mut self, call: CallId, event: TransportEvent) {
        let Some(session) = self.current_mut(call) else {
            tracing::debug!("Ignoring transport event of stale call {}: {:?}", call, event);
            return;
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if session.local_description_sent() {
                    let peer = session.peer().to_string();
                    let _ = self.send(&peer, Signal::IceCandidate { candidate });
                } else {
                    session.buffer_local_candidate(candidate);
                }
            }
            TransportEvent::StateChanged(state) => {
                tracing::debug!("Transport state of call {}: {:?}", call, state);
                if state.is_terminal() {
                    tracing::warn!("Transport of call {} {:?}", call, state);
                    self.end_session(EndReason::PeerUnreachable, true).await;
                }
            }
            TransportEvent::RemoteTrack(track) => {
                let visible = session.state() == CallState::Connected;
                session.add_remote_track(track.clone());
                if visible {
                    self.emit(CallEvent::RemoteTrack(track));
                }
            }
        }
    }

    async fn on_substitute_ended(&mut self, call: CallId, track_id: String) {
        let Some(session) = self.current_mut(call) else {
            return;
        };
        if !session.substitution().is_current(&track_id) {
            return;
        }

        tracing::info!("Substitute video track ended, restoring camera");
        if let Err(e) = substitution::restore(session, None).await {
            tracing::warn!("Failed to restore camera: {}", e);
            session.substitution_mut().release();
            self.emit(CallEvent::Error(e.into()));
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::media::TrackKind;
    use crate::call_engine::session::CallRole;
    use crate::call_engine::testing::{
        FakeFailures, FakeMediaSource, FakeTransportFactory, RecordingSink, TransportOp,
    };
    use crate::call_engine::transport::TransportState;
    use crate::signaling::{LocalChannel, LocalRelay};

    const WAIT: Duration = Duration::from_secs(2);

    fn settings() -> EngineSettings {
        EngineSettings {
            ended_linger: Duration::from_millis(200),
            ..EngineSettings::default()
        }
    }

    struct Peer {
        engine: CallEngine,
        media: Arc<FakeMediaSource>,
        transports: Arc<FakeTransportFactory>,
        channel: LocalChannel,
    }

    fn join(relay: &LocalRelay, identity: &str, media: FakeMediaSource) -> Peer {
        let (channel, inbound) = relay.connect(identity).unwrap();
        let media = Arc::new(media);
        let transports = Arc::new(FakeTransportFactory::new(identity));
        let engine = CallEngine::spawn(
            identity,
            Arc::new(channel.clone()),
            media.clone(),
            transports.clone(),
            settings(),
        );
        engine.pump(inbound);
        Peer {
            engine,
            media,
            transports,
            channel,
        }
    }

    struct Solo {
        engine: CallEngine,
        sink: Arc<RecordingSink>,
        media: Arc<FakeMediaSource>,
        transports: Arc<FakeTransportFactory>,
    }

    fn solo(identity: &str) -> Solo {
        let sink = Arc::new(RecordingSink::new());
        let media = Arc::new(FakeMediaSource::new());
        let transports = Arc::new(FakeTransportFactory::new(identity));
        let engine = CallEngine::spawn(
            identity,
            sink.clone(),
            media.clone(),
            transports.clone(),
            settings(),
        );
        Solo {
            engine,
            sink,
            media,
            transports,
        }
    }

    fn offer_from(from: &str, to: &str, call_type: CallType) -> Envelope {
        Envelope::new(
            from,
            to,
            Signal::Offer {
                sdp: SessionDescription::offer(format!("offer-from-{}", from)),
                call_type,
            },
        )
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 5000 typ host", n, n))
    }

    async fn wait_state(engine: &CallEngine, state: CallState) {
        assert!(
            engine.wait_until(WAIT, |s| s.state == state).await,
            "timed out waiting for {:?}, now {:?}",
            state,
            engine.snapshot().state
        );
    }

    async fn wait_not_live(engine: &CallEngine) {
        assert!(
            engine
                .wait_until(WAIT, |s| matches!(s.state, CallState::Ended | CallState::Idle))
                .await
        );
    }

    /// Baut einen verbundenen Anruf alice -> bob auf
    async fn connected_pair(call_type: CallType) -> (LocalRelay, Peer, Peer) {
        let relay = LocalRelay::new();
        let alice = join(&relay, "alice", FakeMediaSource::new());
        let bob = join(&relay, "bob", FakeMediaSource::new());

        alice.engine.start_call("bob", call_type).await.unwrap();
        wait_state(&bob.engine, CallState::IncomingOffer).await;
        bob.engine.accept_call().await.unwrap();
        wait_state(&alice.engine, CallState::Connected).await;
        (relay, alice, bob)
    }

    #[tokio::test]
    async fn test_video_call_connects_both_sides() {
        let relay = LocalRelay::new();
        let alice = join(&relay, "alice", FakeMediaSource::new());
        let bob = join(&relay, "bob", FakeMediaSource::new());
        let mut bob_events = bob.engine.subscribe();

        alice.engine.start_call("bob", CallType::Video).await.unwrap();
        assert_eq!(alice.engine.snapshot().state, CallState::OutgoingOffer);

        wait_state(&bob.engine, CallState::IncomingOffer).await;
        let incoming = bob.engine.snapshot().incoming.unwrap();
        assert_eq!(incoming.from, "alice");
        assert_eq!(incoming.call_type, CallType::Video);
        assert!(incoming.has_offer);
        assert!(bob.transports.created().is_empty());

        let mut saw_incoming = false;
        while let Ok(event) = bob_events.try_recv() {
            if let CallEvent::IncomingCall { from, call_type } = event {
                assert_eq!((from.as_str(), call_type), ("alice", CallType::Video));
                saw_incoming = true;
            }
        }
        assert!(saw_incoming);

        bob.engine.accept_call().await.unwrap();
        let snapshot = bob.engine.snapshot();
        assert_eq!(snapshot.state, CallState::Connected);
        assert_eq!(snapshot.local_tracks.len(), 2);
        assert!(snapshot.connected_at.is_some());

        wait_state(&alice.engine, CallState::Connected).await;
        assert_eq!(alice.engine.snapshot().role, Some(CallRole::Caller));

        let alice_ops = alice.transports.last().unwrap().ops();
        assert!(alice_ops.contains(&TransportOp::CreateOffer));
        assert!(alice_ops.contains(&TransportOp::SetRemote(SdpKind::Answer)));
        let bob_ops = bob.transports.last().unwrap().ops();
        assert!(bob_ops.contains(&TransportOp::SetRemote(SdpKind::Offer)));
        assert!(bob_ops.contains(&TransportOp::CreateAnswer));
        assert!(!bob_ops.contains(&TransportOp::CreateOffer));
    }

    fn candidate_from(from: &str, to: &str, n: u32) -> Envelope {
        Envelope::new(from, to, Signal::IceCandidate { candidate: candidate(n) })
    }

    fn answer_from(from: &str, to: &str) -> Envelope {
        Envelope::new(
            from,
            to,
            Signal::Answer {
                sdp: SessionDescription::answer(format!("answer-from-{}", from)),
            },
        )
    }

    /// Ein Candidate vor dem Offer, zwei danach, dann `accept_call()`.
    /// Liefert die Reihenfolge, in der der Transport sie erhalten hat.
    async fn accept_with_early_candidates(bob: &Solo) -> Vec<IceCandidate> {
        bob.engine.deliver(candidate_from("alice", "bob", 1)).unwrap();
        bob.engine
            .deliver(offer_from("alice", "bob", CallType::Audio))
            .unwrap();
        for n in 2..=3 {
            bob.engine.deliver(candidate_from("alice", "bob", n)).unwrap();
        }
        bob.engine.sync().await.unwrap();
        assert_eq!(bob.engine.snapshot().state, CallState::IncomingOffer);

        bob.engine.accept_call().await.unwrap();
        bob.transports.last().unwrap().candidates()
    }

    #[tokio::test]
    async fn test_buffered_candidates_applied_in_order() {
        let bob = solo("bob");
        let applied = accept_with_early_candidates(&bob).await;
        assert_eq!(applied, vec![candidate(1), candidate(2), candidate(3)]);

        // Nach der Remote Description: sofort angewendet
        let transport = bob.transports.last().unwrap();
        bob.engine.deliver(candidate_from("alice", "bob", 4)).unwrap();
        bob.engine.sync().await.unwrap();
        assert_eq!(transport.candidates().len(), 4);
        assert_eq!(bob.sink.actions(), vec!["answer"]);

        // Dieselbe Folge auf einer neuen Session ergibt dieselbe Reihenfolge
        let replay = solo("bob");
        assert_eq!(accept_with_early_candidates(&replay).await, applied);
    }

    #[tokio::test]
    async fn test_late_candidates_do_not_reach_next_call() {
        let alice = solo("alice");
        alice.engine.start_call("bob", CallType::Audio).await.unwrap();
        alice.engine.deliver(answer_from("bob", "alice")).unwrap();
        alice.engine.sync().await.unwrap();
        assert_eq!(alice.engine.snapshot().state, CallState::Connected);

        alice.engine.hang_up().await.unwrap();
        alice.engine.deliver(candidate_from("bob", "alice", 1)).unwrap();
        alice.engine.sync().await.unwrap();

        alice.engine.start_call("bob", CallType::Audio).await.unwrap();
        alice.engine.deliver(answer_from("bob", "alice")).unwrap();
        alice.engine.sync().await.unwrap();

        let second = alice.transports.last().unwrap();
        assert_eq!(alice.transports.created().len(), 2);
        assert_eq!(alice.engine.snapshot().state, CallState::Connected);
        assert!(second.candidates().is_empty());

        alice.engine.deliver(candidate_from("bob", "alice", 2)).unwrap();
        alice.engine.sync().await.unwrap();
        assert_eq!(second.candidates(), vec![candidate(2)]);
    }

    #[tokio::test]
    async fn test_late_candidates_after_reject_are_dropped() {
        let bob = solo("bob");
        bob.engine
            .deliver(offer_from("alice", "bob", CallType::Audio))
            .unwrap();
        bob.engine.reject_call().await.unwrap();
        bob.engine.deliver(candidate_from("alice", "bob", 1)).unwrap();

        bob.engine
            .deliver(offer_from("alice", "bob", CallType::Audio))
            .unwrap();
        bob.engine.accept_call().await.unwrap();
        assert!(bob.transports.last().unwrap().candidates().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_candidates_are_bounded() {
        let sink = Arc::new(RecordingSink::new());
        let transports = Arc::new(FakeTransportFactory::new("bob"));
        let engine = CallEngine::spawn(
            "bob",
            sink,
            Arc::new(FakeMediaSource::new()),
            transports.clone(),
            EngineSettings {
                max_orphan_senders: 1,
                max_orphan_candidates: 2,
                ..settings()
            },
        );

        for n in 1..=4 {
            engine.deliver(candidate_from("alice", "bob", n)).unwrap();
        }
        // Zweiter Absender verdrängt alice
        engine.deliver(candidate_from("carol", "bob", 9)).unwrap();
        engine
            .deliver(offer_from("carol", "bob", CallType::Audio))
            .unwrap();
        engine.accept_call().await.unwrap();
        assert_eq!(transports.last().unwrap().candidates(), vec![candidate(9)]);
        engine.hang_up().await.unwrap();

        for n in 1..=4 {
            engine.deliver(candidate_from("dave", "bob", n)).unwrap();
        }
        engine
            .deliver(offer_from("dave", "bob", CallType::Audio))
            .unwrap();
        engine.accept_call().await.unwrap();
        assert_eq!(
            transports.last().unwrap().candidates(),
            vec![candidate(3), candidate(4)]
        );
    }

    #[tokio::test]
    async fn test_hang_up_during_pending_accept_discards_media() {
        let relay = LocalRelay::new();
        let alice = join(&relay, "alice", FakeMediaSource::new());
        let bob = join(&relay, "bob", FakeMediaSource::gated());

        alice.engine.start_call("bob", CallType::Video).await.unwrap();
        wait_state(&bob.engine, CallState::IncomingOffer).await;

        let accept = {
            let engine = bob.engine.clone();
            tokio::spawn(async move { engine.accept_call().await })
        };
        bob.media.wait_started(1).await;

        alice.engine.hang_up().await.unwrap();
        wait_not_live(&bob.engine).await;

        // Akquise kommt erst jetzt zurück
        bob.media.release_one();
        assert_eq!(accept.await.unwrap(), Err(CallError::Cancelled));

        bob.engine.sync().await.unwrap();
        let snapshot = bob.engine.snapshot();
        assert!(matches!(snapshot.state, CallState::Ended | CallState::Idle));
        assert!(snapshot.local_tracks.is_empty());
        assert!(bob.media.issued().iter().all(|t| t.is_ended()));
        assert!(bob.transports.created().is_empty());

        wait_state(&bob.engine, CallState::Idle).await;
    }

    #[tokio::test]
    async fn test_local_hang_up_during_acquisition() {
        let bob = solo("bob");
        let media = Arc::new(FakeMediaSource::gated());
        let engine = CallEngine::spawn(
            "carol",
            bob.sink.clone(),
            media.clone(),
            bob.transports.clone(),
            settings(),
        );

        let call = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start_call("dave", CallType::Audio).await })
        };
        media.wait_started(1).await;

        engine.hang_up().await.unwrap();
        assert_eq!(engine.snapshot().state, CallState::Ended);

        media.release_one();
        assert_eq!(call.await.unwrap(), Err(CallError::Cancelled));
        assert!(media.issued().iter().all(|t| t.is_ended()));
        assert!(bob.transports.created().is_empty());
        assert!(!bob.sink.actions().contains(&"offer"));
    }

    #[tokio::test]
    async fn test_new_call_replaces_active_session() {
        let relay = LocalRelay::new();
        let alice = join(&relay, "alice", FakeMediaSource::new());
        let bob = join(&relay, "bob", FakeMediaSource::new());
        let carol = join(&relay, "carol", FakeMediaSource::new());

        alice.engine.start_call("bob", CallType::Audio).await.unwrap();
        wait_state(&bob.engine, CallState::IncomingOffer).await;
        let first = alice.transports.last().unwrap();

        alice.engine.start_call("carol", CallType::Audio).await.unwrap();
        let snapshot = alice.engine.snapshot();
        assert_eq!(snapshot.state, CallState::OutgoingOffer);
        assert_eq!(snapshot.peer.as_deref(), Some("carol"));
        assert!(first.is_closed());
        assert_eq!(alice.media.issued().iter().filter(|t| t.is_ended()).count(), 1);

        // bob erhält call_end, carol den neuen Anruf
        wait_not_live(&bob.engine).await;
        wait_state(&carol.engine, CallState::IncomingOffer).await;
    }

    #[tokio::test]
    async fn test_glare_rejects_second_caller() {
        let alice = solo("alice");
        let mut events = alice.engine.subscribe();

        alice.engine.start_call("bob", CallType::Audio).await.unwrap();
        alice
            .engine
            .deliver(offer_from("carol", "alice", CallType::Audio))
            .unwrap();
        alice.engine.sync().await.unwrap();

        let snapshot = alice.engine.snapshot();
        assert_eq!(snapshot.state, CallState::OutgoingOffer);
        assert_eq!(snapshot.peer.as_deref(), Some("bob"));

        let sent = alice.sink.sent();
        let rejection = sent.last().unwrap();
        assert_eq!(rejection.to, "carol");
        assert_eq!(rejection.signal, Signal::CallEnd);
        assert!(!alice.transports.last().unwrap().is_closed());

        let mut saw_glare = false;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Error(CallError::GlareConflict(from)) = event {
                assert_eq!(from, "carol");
                saw_glare = true;
            }
        }
        assert!(saw_glare);
    }

    #[tokio::test]
    async fn test_substitute_restore_and_auto_restore() {
        let (_relay, alice, _bob) = connected_pair(CallType::Video).await;
        let transport = alice.transports.last().unwrap();
        let camera = alice.engine.snapshot().local_tracks[1].clone();
        assert_eq!(camera.kind(), TrackKind::Video);

        let screen = MediaTrack::new(TrackKind::Video, "screen");
        alice
            .engine
            .substitute_outgoing_video(screen.clone())
            .await
            .unwrap();
        assert!(alice.engine.snapshot().sharing_screen);
        assert_eq!(transport.outgoing_video(), Some(screen.id().to_string()));

        alice
            .engine
            .restore_outgoing_video(camera.clone())
            .await
            .unwrap();
        assert!(!alice.engine.snapshot().sharing_screen);
        assert!(screen.is_ended());
        assert!(!camera.is_ended());
        assert_eq!(transport.outgoing_video(), Some(camera.id().to_string()));

        // Freigabe endet von außen: Kamera kommt automatisch zurück
        let second = MediaTrack::new(TrackKind::Video, "screen-2");
        alice
            .engine
            .substitute_outgoing_video(second.clone())
            .await
            .unwrap();
        second.stop();
        assert!(alice.engine.wait_until(WAIT, |s| !s.sharing_screen).await);
        assert_eq!(transport.outgoing_video(), Some(camera.id().to_string()));
        assert_eq!(alice.engine.snapshot().state, CallState::Connected);
    }

    #[tokio::test]
    async fn test_substitution_rejected_for_audio_call() {
        let (_relay, alice, _bob) = connected_pair(CallType::Audio).await;
        let screen = MediaTrack::new(TrackKind::Video, "screen");
        assert_eq!(
            alice.engine.substitute_outgoing_video(screen).await,
            Err(CallError::UnsupportedForAudio)
        );
    }

    #[tokio::test]
    async fn test_device_failure_notifies_caller() {
        let relay = LocalRelay::new();
        let alice = join(&relay, "alice", FakeMediaSource::new());
        let bob = join(&relay, "bob", FakeMediaSource::new());
        bob.media.fail_with(Some(MediaError::busy("camera")));

        alice.engine.start_call("bob", CallType::Video).await.unwrap();
        wait_state(&bob.engine, CallState::IncomingOffer).await;

        let err = bob.engine.accept_call().await.unwrap_err();
        assert_eq!(err, CallError::DeviceUnavailable(MediaError::busy("camera")));
        let snapshot = bob.engine.snapshot();
        assert_eq!(snapshot.state, CallState::Ended);
        assert_eq!(snapshot.end_reason, Some(EndReason::DeviceUnavailable));

        wait_not_live(&alice.engine).await;
        assert!(alice.transports.last().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_negotiation_failure_ends_call() {
        let alice = solo("alice");
        alice.transports.set_failures(FakeFailures {
            offer: true,
            ..Default::default()
        });

        let err = alice
            .engine
            .start_call("bob", CallType::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NegotiationFailure(_)));
        assert_eq!(alice.engine.snapshot().end_reason, Some(EndReason::NegotiationFailure));
        assert_eq!(alice.sink.actions(), vec!["call_end"]);
        assert!(alice.media.issued().iter().all(|t| t.is_ended()));
    }

    async fn assert_accept_fails_with(failures: FakeFailures) {
        let bob = solo("bob");
        bob.transports.set_failures(failures);
        bob.engine
            .deliver(offer_from("alice", "bob", CallType::Video))
            .unwrap();

        let err = bob.engine.accept_call().await.unwrap_err();
        assert!(matches!(err, CallError::NegotiationFailure(_)));

        let snapshot = bob.engine.snapshot();
        assert_eq!(snapshot.state, CallState::Ended);
        assert_eq!(snapshot.end_reason, Some(EndReason::NegotiationFailure));
        assert!(snapshot.local_tracks.is_empty());
        assert_eq!(bob.sink.actions(), vec!["call_end"]);
        assert_eq!(bob.sink.sent()[0].to, "alice");
        assert_eq!(bob.media.issued().len(), 2);
        assert!(bob.media.issued().iter().all(|t| t.is_ended()));
        assert!(bob.transports.last().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_rejected_remote_description_ends_incoming_call() {
        assert_accept_fails_with(FakeFailures {
            remote: true,
            ..Default::default()
        })
        .await;
    }

    #[tokio::test]
    async fn test_failed_answer_ends_incoming_call() {
        assert_accept_fails_with(FakeFailures {
            answer: true,
            ..Default::default()
        })
        .await;
    }

    #[tokio::test]
    async fn test_transport_failure_tears_down_both_sides() {
        let (_relay, alice, bob) = connected_pair(CallType::Video).await;
        let transport = alice.transports.last().unwrap();

        transport.emit(TransportEvent::StateChanged(TransportState::Failed));
        wait_not_live(&alice.engine).await;

        let snapshot = alice.engine.snapshot();
        assert_eq!(snapshot.end_reason, Some(EndReason::PeerUnreachable));
        assert!(snapshot.local_tracks.is_empty());
        assert!(snapshot.remote_tracks.is_empty());
        assert!(transport.is_closed());

        wait_not_live(&bob.engine).await;
        assert!(bob.transports.last().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_signaling_close_ends_call() {
        let (relay, _alice, bob) = connected_pair(CallType::Audio).await;

        relay.disconnect("bob");
        wait_not_live(&bob.engine).await;

        let snapshot = bob.engine.snapshot();
        assert_eq!(snapshot.end_reason, Some(EndReason::SignalingClosed));
        assert!(!snapshot.signaling_connected);
        assert!(bob.transports.last().unwrap().is_closed());
        assert!(!bob.channel.is_open());

        assert_eq!(
            bob.engine.start_call("alice", CallType::Audio).await,
            Err(CallError::TransportUnavailable)
        );
    }

    #[tokio::test]
    async fn test_closed_channel_leaves_state_unchanged() {
        let alice = solo("alice");
        alice.sink.set_open(false);

        assert_eq!(
            alice.engine.start_call("bob", CallType::Audio).await,
            Err(CallError::TransportUnavailable)
        );
        assert_eq!(alice.engine.snapshot().state, CallState::Idle);
        assert_eq!(alice.media.calls(), 0);
        assert!(alice.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_call_end_invalidates_incoming_offer() {
        let bob = solo("bob");
        bob.engine
            .deliver(offer_from("alice", "bob", CallType::Audio))
            .unwrap();
        bob.engine
            .deliver(Envelope::new("alice", "bob", Signal::CallEnd))
            .unwrap();
        bob.engine.sync().await.unwrap();

        assert_eq!(bob.engine.accept_call().await, Err(CallError::NoIncomingCall));
        assert_eq!(bob.media.calls(), 0);
    }

    #[tokio::test]
    async fn test_call_request_then_offer() {
        let bob = solo("bob");
        bob.engine
            .deliver(Envelope::new(
                "alice",
                "bob",
                Signal::CallRequest {
                    call_type: CallType::Video,
                },
            ))
            .unwrap();
        bob.engine.sync().await.unwrap();
        assert_eq!(bob.engine.accept_call().await, Err(CallError::OfferNotReceived));
        assert_eq!(bob.engine.snapshot().state, CallState::IncomingOffer);

        bob.engine
            .deliver(offer_from("alice", "bob", CallType::Video))
            .unwrap();
        bob.engine.accept_call().await.unwrap();
        assert_eq!(bob.engine.snapshot().state, CallState::Connected);
    }

    #[tokio::test]
    async fn test_reject_sends_call_end_and_goes_idle() {
        let bob = solo("bob");
        bob.engine
            .deliver(offer_from("alice", "bob", CallType::Audio))
            .unwrap();
        bob.engine.reject_call().await.unwrap();

        assert_eq!(bob.engine.snapshot().state, CallState::Idle);
        let sent = bob.sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "alice");
        assert_eq!(sent[0].signal, Signal::CallEnd);
        assert_eq!(bob.engine.reject_call().await, Err(CallError::NoIncomingCall));
    }

    #[tokio::test]
    async fn test_duplicate_answer_is_ignored() {
        let alice = solo("alice");
        alice.engine.start_call("bob", CallType::Audio).await.unwrap();
        let transport = alice.transports.last().unwrap();

        // Remote-Track vor Connected bleibt unsichtbar
        transport.emit(TransportEvent::RemoteTrack(RemoteTrack {
            id: "r1".to_string(),
            kind: TrackKind::Audio,
        }));
        alice.engine.sync().await.unwrap();
        assert!(alice.engine.snapshot().remote_tracks.is_empty());

        let answer = Envelope::new(
            "bob",
            "alice",
            Signal::Answer {
                sdp: SessionDescription::answer("answer-from-bob"),
            },
        );
        alice.engine.deliver(answer.clone()).unwrap();
        alice.engine.deliver(answer).unwrap();
        alice.engine.sync().await.unwrap();

        let snapshot = alice.engine.snapshot();
        assert_eq!(snapshot.state, CallState::Connected);
        assert_eq!(snapshot.remote_tracks.len(), 1);
        let applied = transport
            .ops()
            .iter()
            .filter(|op| matches!(op, TransportOp::SetRemote(_)))
            .count();
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_local_candidates_follow_offer() {
        let alice = solo("alice");
        alice.engine.start_call("bob", CallType::Audio).await.unwrap();
        let transport = alice.transports.last().unwrap();

        transport.emit(TransportEvent::LocalCandidate(candidate(9)));
        alice.engine.sync().await.unwrap();

        assert_eq!(alice.sink.actions(), vec!["offer", "ice_candidate"]);
        assert_eq!(
            alice.sink.sent()[1].signal,
            Signal::IceCandidate {
                candidate: candidate(9)
            }
        );
    }

    #[tokio::test]
    async fn test_mute_and_video_toggles() {
        let (_relay, alice, _bob) = connected_pair(CallType::Video).await;

        alice.engine.set_muted(true).await.unwrap();
        alice.engine.set_video_enabled(false).await.unwrap();
        let snapshot = alice.engine.snapshot();
        assert!(snapshot.muted);
        assert!(!snapshot.video_enabled);
        assert!(snapshot.local_tracks.iter().all(|t| !t.is_enabled()));

        alice.engine.set_muted(false).await.unwrap();
        let snapshot = alice.engine.snapshot();
        assert!(snapshot.local_tracks[0].is_enabled());
    }

    #[tokio::test]
    async fn test_intents_without_call() {
        let alice = solo("alice");
        assert_eq!(alice.engine.hang_up().await, Err(CallError::NoActiveCall));
        assert_eq!(alice.engine.set_muted(true).await, Err(CallError::NoActiveCall));
        assert_eq!(alice.engine.accept_call().await, Err(CallError::NoIncomingCall));
        assert_eq!(
            alice.engine.start_call("bad name", CallType::Audio).await,
            Err(CallError::InvalidPeer("bad name".to_string()))
        );
        assert_eq!(
            alice.engine.start_call("alice", CallType::Audio).await,
            Err(CallError::InvalidPeer("alice".to_string()))
        );
    }

    #[tokio::test]
    async fn test_ended_lingers_then_idle() {
        let (_relay, alice, bob) = connected_pair(CallType::Audio).await;

        alice.engine.hang_up().await.unwrap();
        assert_eq!(alice.engine.snapshot().state, CallState::Ended);
        wait_state(&alice.engine, CallState::Idle).await;
        wait_state(&bob.engine, CallState::Idle).await;
        assert_eq!(bob.engine.snapshot().call_id, None);
    }
}
