//! Message Types für das Relay-Protokoll
//!
//! Jede Nachricht ist ein JSON-Objekt `{"type": "...", "payload": {...}}`.
//! Das Relay leitet die Payload unverändert an den Ziel-Socket weiter.

use serde::{Deserialize, Serialize};

// ============================================================================
// OPAQUE BLOBS
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Verbindungsbeschreibung (SDP), wie sie Browser als JSON senden
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im Format von `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
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
// CLIENT → RELAY MESSAGES
// ============================================================================

/// Nachrichten, die dieser Client an das Relay schickt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum OutgoingMessage {
    /// Anruf starten
    CallUser {
        #[serde(rename = "userToCall")]
        user_to_call: String,
        #[serde(rename = "signalData")]
        signal_data: SessionDescription,
    },

    /// Anruf annehmen
    AnswerCall {
        to: String,
        signal: SessionDescription,
    },

    /// Anruf ablehnen
    RejectCall { to: String },

    /// ICE Candidate weiterleiten
    IceCandidate { to: String, candidate: IceCandidate },

    /// Anruf beenden
    EndCall { to: String },
}

impl OutgoingMessage {
    /// Event-Name auf dem Draht
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CallUser { .. } => "call-user",
            Self::AnswerCall { .. } => "answer-call",
            Self::RejectCall { .. } => "reject-call",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::EndCall { .. } => "end-call",
        }
    }

    /// Ziel-Peer der Nachricht
    pub fn target(&self) -> &str {
        match self {
            Self::CallUser { user_to_call, .. } => user_to_call,
            Self::AnswerCall { to, .. }
            | Self::RejectCall { to }
            | Self::IceCandidate { to, .. }
            | Self::EndCall { to } => to,
        }
    }
}

// ============================================================================
// RELAY → CLIENT MESSAGES
// ============================================================================

/// Eintrag der Teilnehmerliste
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub id: String,
}

/// Alle Nachrichten, die das Relay zustellen kann
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum IncomingMessage {
    /// Eigene Socket-ID nach dem Verbinden
    YourId { id: String },

    /// Aktuelle Teilnehmer
    UsersList(Vec<PresenceEntry>),

    /// Eingehender Anruf mit Offer
    IncomingCall {
        from: String,
        signal: SessionDescription,
    },

    /// Gegenseite hat angenommen
    CallAccepted { signal: SessionDescription },

    /// Gegenseite hat abgelehnt
    CallRejected,

    /// Gegenseite ist besetzt
    UserBusy,

    /// ICE Candidate der Gegenseite
    IceCandidate { from: String, candidate: IceCandidate },

    /// Gegenseite hat aufgelegt
    CallEnded,
}

impl IncomingMessage {
    /// Event-Name auf dem Draht
    pub fn kind(&self) -> &'static str {
        match self {
            Self::YourId { .. } => "your-id",
            Self::UsersList(_) => "users-list",
            Self::IncomingCall { .. } => "incoming-call",
            Self::CallAccepted { .. } => "call-accepted",
            Self::CallRejected => "call-rejected",
            Self::UserBusy => "user-busy",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallEnded => "call-ended",
        }
    }
}
