//! WebRTC Transport
//!
//! [`MediaTransport`] auf Basis von webrtc-rs. Jeder lokale [`MediaTrack`]
//! wird als `TrackLocalStaticSample` an die Peer Connection gehängt.
//! Encoder außerhalb dieses Crates schreiben ihre Samples über
//! [`RtcTransport::sample_track`]; der Crate selbst erzeugt keine Samples.

use super::media::{MediaTrack, RemoteTrack, TrackKind};
use super::transport::{
    MediaTransport, TransportError, TransportEvent, TransportEventSink, TransportFactory,
    TransportState,
};
use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Stream-ID aller lokalen Tracks
const STREAM_ID: &str = "peer-call";

fn rtc_error(e: webrtc::Error) -> TransportError {
    TransportError::Rtc(e.to_string())
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| TransportError::InvalidSdp(e.to_string()))
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, TransportError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(TransportError::InvalidSdp(format!(
            "unexpected local description type {}",
            other
        ))),
    }
}

fn from_rtc_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => TransportState::New,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt [`RtcTransport`]s mit den konfigurierten ICE-Servern
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        Self {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let transport: Arc<dyn MediaTransport> = self.create_rtc(events).await?;
        Ok(transport)
    }
}

impl RtcTransportFactory {
    /// Wie [`TransportFactory::create`], aber mit konkretem Typ für Aufrufer,
    /// die Samples einspeisen
    pub async fn create_rtc(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<RtcTransport>, TransportError> {
        // Media Engine mit Opus/VP8
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_error)?);
        install_handlers(&pc, events);

        Ok(Arc::new(RtcTransport {
            pc,
            local_tracks: Mutex::new(HashMap::new()),
        }))
    }
}

/// Registriert die Callbacks der Peer Connection
fn install_handlers(pc: &RTCPeerConnection, events: TransportEventSink) {
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        sink.emit(TransportEvent::StateChanged(from_rtc_state(s)));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => sink.emit(TransportEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        tracing::info!("Received remote {:?} track: {:?}", kind, track.codec());
        sink.emit(TransportEvent::RemoteTrack(RemoteTrack {
            id: track.id(),
            kind,
        }));
        Box::pin(async {})
    }));
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Peer Connection von webrtc-rs
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl RtcTransport {
    /// Sample-Senke zum lokalen Track mit der ID `track_id`, solange dieser
    /// Track gesendet wird. Einspeisung etwa mit `write_sample`.
    pub fn sample_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(track_id).cloned()
    }

    fn sample_track_for(&self, track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_owned(),
            STREAM_ID.to_owned(),
        ));
        self.local_tracks
            .lock()
            .insert(track.id().to_owned(), Arc::clone(&local));
        local
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let local = self.sample_track_for(track);
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_error)?;
        Ok(())
    }

    async fn create_local_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_error)?;
        from_rtc_description(offer)
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_error)?;
        from_rtc_description(answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(rtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(rtc_error)
    }

    async fn replace_outgoing_video(&self, track: &MediaTrack) -> Result<(), TransportError> {
        for sender in self.pc.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            if current.kind() != RTPCodecType::Video {
                continue;
            }

            let replacement = self.sample_track_for(track);
            sender
                .replace_track(Some(replacement as Arc<dyn TrackLocal + Send + Sync>))
                .await
                .map_err(rtc_error)?;
            self.local_tracks.lock().remove(current.id());
            return Ok(());
        }

        Err(TransportError::NoVideoSender)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.local_tracks.lock().clear();
        self.pc.close().await.map_err(rtc_error)
    }
}

// ============================================================================
// TESTS
// ============================================================================
