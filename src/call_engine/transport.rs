//! Transport-Schnittstelle
//!
//! Der eigentliche Medientransport (ICE, DTLS, RTP) ist ein externer
//! Kollaborateur. Die Call-Session spricht nur über diese Traits mit ihm.

use super::frame::AudioFrame;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport setup failed: {0}")]
    Setup(String),

    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("Frame delivery failed: {0}")]
    Delivery(String),

    #[error("Transport closed")]
    Closed,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events, die der Transport an seine Session meldet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Lokal gefundener ICE Candidate
    LocalCandidate(IceCandidate),
    /// Verbindung steht, Medien können fließen
    ConnectivityEstablished,
    /// Verbindung ist endgültig gescheitert
    ConnectivityFailed(String),
    /// Transport wurde geschlossen
    Closed,
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

// ============================================================================
// TRAITS
// ============================================================================

/// Ziel für Audio-Frames
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn push_audio_frame(&self, frame: &AudioFrame) -> Result<(), TransportError>;
}

/// Ein Transport pro Session.
///
/// `create_local_description` liefert ein Offer, solange keine Remote
/// Description gesetzt ist, sonst ein Answer.
#[async_trait]
pub trait MediaTransport: FrameSink {
    async fn create_local_description(
        &self,
        want_audio: bool,
    ) -> Result<SessionDescription, TransportError>;

    async fn apply_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn apply_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Erzeugt Transporte. Lokale Candidates und Konnektivitätswechsel meldet
/// der Transport über `events`.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: TransportEventSender,
        send_audio: bool,
    ) -> Result<Arc<dyn MediaTransport>, TransportError>;
}
