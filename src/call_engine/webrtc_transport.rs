//! WebRTC Transport
//!
//! Implementiert `MediaTransport` mit webrtc-rs. Audio geht als lineares
//! PCM (`audio/L16`, RFC 3551) mit der Ziel-Rate über eine RTP-Spur:
//! ein RTP-Paket pro AudioFrame.

use super::frame::AudioFrame;
use super::transport::{
    FrameSink, MediaTransport, TransportError, TransportEvent, TransportEventSender,
    TransportFactory,
};
use crate::signaling::{DescriptionKind, IceCandidate, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

/// Dynamischer Payload-Type für L16
const L16_PAYLOAD_TYPE: u8 = 118;

const L16_MIME_TYPE: &str = "audio/L16";

fn l16_capability(sample_rate: u32) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: L16_MIME_TYPE.to_string(),
        clock_rate: sample_rate,
        channels: 1,
        ..Default::default()
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt pro Session eine neue Peer Connection
#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<String>,
    sample_rate: u32,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<String>, sample_rate: u32) -> Self {
        Self {
            ice_servers,
            sample_rate,
        }
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: l16_capability(self.sample_rate),
                    payload_type: L16_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        Ok(Arc::new(pc))
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(pc: &RTCPeerConnection, events: TransportEventSender) {
        let events_clone = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);

            let event = match s {
                RTCPeerConnectionState::Connected => Some(TransportEvent::ConnectivityEstablished),
                RTCPeerConnectionState::Failed => Some(TransportEvent::ConnectivityFailed(
                    "peer connection failed".to_string(),
                )),
                RTCPeerConnectionState::Closed => Some(TransportEvent::Closed),
                _ => None,
            };
            if let Some(event) = event {
                let _ = events_clone.send(event);
            }

            Box::pin(async {})
        }));

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        pc.on_track(Box::new(move |track, _, _| {
            Box::pin(async move {
                tracing::info!(
                    "Received remote track: {}",
                    track.codec().capability.mime_type
                );
            })
        }));
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        events: TransportEventSender,
        send_audio: bool,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let pc = self.create_peer_connection().await?;
        Self::setup_handlers(&pc, events);

        let track = if send_audio {
            let track = Arc::new(TrackLocalStaticRTP::new(
                l16_capability(self.sample_rate),
                "audio".to_string(),
                "pulse-stream".to_string(),
            ));
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?;

            // RTCP lesen, damit die Interceptors arbeiten
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
            Some(track)
        } else {
            None
        };

        Ok(Arc::new(WebRtcTransport {
            pc,
            track,
            rtp: Mutex::new(RtpState::random()),
        }))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug)]
struct RtpState {
    sequence_number: u16,
    timestamp: u32,
    first_packet: bool,
}

impl RtpState {
    /// Zufällige Startwerte nach RFC 3550
    fn random() -> Self {
        Self {
            sequence_number: rand::random(),
            timestamp: rand::random(),
            first_packet: true,
        }
    }

    /// Header-Felder für das nächste Paket, danach weiterzählen
    fn advance(&mut self, samples: usize) -> (u16, u32, bool) {
        let fields = (self.sequence_number, self.timestamp, self.first_packet);
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples as u32);
        self.first_packet = false;
        fields
    }
}

/// Eine Peer Connection mit optionaler ausgehender Audiospur
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    track: Option<Arc<TrackLocalStaticRTP>>,
    rtp: Mutex<RtpState>,
}

fn to_rtc_description(
    description: &SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let sdp = description.sdp.clone();
    match description.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(sdp),
        DescriptionKind::Answer => RTCSessionDescription::answer(sdp),
    }
    .map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

#[async_trait]
impl FrameSink for WebRtcTransport {
    async fn push_audio_frame(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        let track = self
            .track
            .as_ref()
            .ok_or_else(|| TransportError::Delivery("no outgoing audio track".to_string()))?;

        let (sequence_number, timestamp, marker) = self.rtp.lock().advance(frame.len());
        let packet = Packet {
            header: Header {
                version: 2,
                marker,
                payload_type: L16_PAYLOAD_TYPE,
                sequence_number,
                timestamp,
                ..Default::default()
            },
            payload: Bytes::from(frame.to_be_bytes()),
        };

        track
            .write_rtp(&packet)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Delivery(e.to_string()))
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_local_description(
        &self,
        want_audio: bool,
    ) -> Result<SessionDescription, TransportError> {
        if want_audio && self.pc.get_transceivers().await.is_empty() {
            self.pc
                .add_transceiver_from_kind(RTPCodecType::Audio, None)
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?;
        }

        if self.pc.remote_description().await.is_some() {
            let answer = self
                .pc
                .create_answer(None)
                .await
                .map_err(|e| TransportError::Negotiation(e.to_string()))?;
            Ok(SessionDescription::answer(answer.sdp))
        } else {
            let offer = self
                .pc
                .create_offer(None)
                .await
                .map_err(|e| TransportError::Negotiation(e.to_string()))?;
            Ok(SessionDescription::offer(offer.sdp))
        }
    }

    async fn apply_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn apply_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_state_advances_per_frame() {
        let mut state = RtpState {
            sequence_number: u16::MAX,
            timestamp: u32::MAX - 100,
            first_packet: true,
        };

        assert_eq!(state.advance(480), (u16::MAX, u32::MAX - 100, true));
        let (seq, ts, marker) = state.advance(480);
        assert_eq!(seq, 0);
        assert_eq!(ts, 379);
        assert!(!marker);
    }

    #[test]
    fn test_description_conversion() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
        let offer = to_rtc_description(&SessionDescription::offer(sdp)).unwrap();
        assert_eq!(offer.sdp, sdp);
        assert!(to_rtc_description(&SessionDescription::answer("garbage")).is_err());
    }
}
