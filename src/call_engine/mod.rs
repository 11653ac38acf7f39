//! Call Engine Module - Peer Session und Media
//!
//! Dieses Modul verwaltet:
//! - Zustandsautomat eines Anrufs (Peer Session)
//! - Puffer für ICE Candidates
//! - Media-Akquise und Track-Ersetzung
//! - WebRTC Peer Connections

mod engine;
mod ice_buffer;
mod media;
mod rtc;
mod session;
mod substitution;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{CallEngine, CallError, CallEvent, EngineSettings};
pub use ice_buffer::{IceCandidateBuffer, OrphanCandidates};
pub use media::{
    DeviceMediaSource, LocalTrackSet, MediaError, MediaSource, MediaTrack, RemoteTrack, TrackKind,
};
pub use rtc::{RtcTransport, RtcTransportFactory};
pub use session::{
    CallId, CallRole, CallSnapshot, CallState, EndReason, IncomingCall, PeerSession,
};
pub use substitution::{SubstitutionError, TrackSubstitution};
pub use transport::{
    MediaTransport, TransportError, TransportEvent, TransportEventSink, TransportFactory,
    TransportState,
};
