//! Pulse Stream - P2P Audio-Anrufe über ein Signaling-Relay
//!
//! - WebSocket-Relay für Offer/Answer und ICE Candidates
//! - WebRTC für den Medientransport
//! - Audio-Assets werden gemischt, resampled und im Echtzeittakt gestreamt

pub mod app;
pub mod call_engine;
pub mod config;
pub mod signaling;

pub use app::{prepare_audio, CallApp, IntentError, UserIntent};
pub use call_engine::{CallError, CallEvent, CallSession, CallState, SessionHandle};
pub use config::{AppConfig, SessionConfig, StreamConfig};
pub use signaling::{SignalingClient, SignalingError, SignalingEvent};

use tracing_subscriber::EnvFilter;

/// Standard-Filter, wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "pulse_stream=debug,webrtc=warn";

/// Logging initialisieren. Mehrfacher Aufruf ist harmlos.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
