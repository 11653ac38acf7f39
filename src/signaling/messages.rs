//! Message Types für das Signaling-Protokoll
//!
//! Diese Strukturen spiegeln das JSON-Format wider, das Browser-Clients
//! über das Relay austauschen (`action`-Tag, `from`, `target`, ...), und
//! ermöglichen typsichere Kommunikation.

use serde::{Deserialize, Serialize};

// ============================================================================
// CALL TYPE
// ============================================================================

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Nur Audio
    #[default]
    Audio,
    /// Audio + Video
    Video,
}

impl CallType {
    pub fn has_video(self) -> bool {
        matches!(self, CallType::Video)
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallType::Audio => f.write_str("audio"),
            CallType::Video => f.write_str("video"),
        }
    }
}

impl std::str::FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(CallType::Audio),
            "video" => Ok(CallType::Video),
            other => Err(format!("unknown call type '{}'", other)),
        }
    }
}

// ============================================================================
// SESSION DESCRIPTION / ICE
// ============================================================================

/// Typ einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session Description im Browser-Format (`{"type": "offer", "sdp": "..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im Format von `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Nutzdaten einer Signaling-Nachricht, unterschieden über das `action`-Feld
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Signal {
    /// Anruf ankündigen (ohne SDP)
    CallRequest {
        #[serde(rename = "callType", default)]
        call_type: CallType,
    },

    /// SDP Offer des Anrufers
    Offer {
        sdp: SessionDescription,
        #[serde(rename = "callType", default)]
        call_type: CallType,
    },

    /// SDP Answer des Angerufenen
    Answer { sdp: SessionDescription },

    /// ICE Candidate
    IceCandidate { candidate: IceCandidate },

    /// Anruf beenden / ablehnen
    CallEnd,
}

impl Signal {
    /// Name des `action`-Felds, für Logs
    pub fn action(&self) -> &'static str {
        match self {
            Signal::CallRequest { .. } => "call_request",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::IceCandidate { .. } => "ice_candidate",
            Signal::CallEnd => "call_end",
        }
    }
}

/// Signaling-Envelope: Absender, Empfänger und Nutzdaten.
///
/// Der Empfänger wird als `target` serialisiert, weil das Relay anhand dieses
/// Felds weiterleitet; beim Lesen wird auch `to` akzeptiert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    #[serde(rename = "target", alias = "to")]
    pub to: String,
    #[serde(flatten)]
    pub signal: Signal,
}

impl Envelope {
    pub fn new(from: impl Into<String>, to: impl Into<String>, signal: Signal) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            signal,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ============================================================================
// IDENTITY
// ============================================================================

/// Prüft, ob eine Identität vom Relay geroutet werden kann (`\w+`)
pub fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty() && identity.chars().all(|c| c.is_alphanumeric() || c == '_')
}

// ============================================================================
// TESTS
// ============================================================================
