//! Call Engine Module - Session und Audio-Pipeline
//!
//! Dieses Modul verwaltet:
//! - Den Zustandsautomaten eines Anrufs (Offer/Answer, ICE Candidates)
//! - Audio-Assets laden, mischen, resamplen und formen
//! - Frames im Echtzeittakt an den Transport liefern
//! - WebRTC als Medientransport

mod actor;
mod audio;
mod frame;
mod resample;
mod scheduler;
mod session;
mod transport;
mod webrtc_transport;

pub use actor::{spawn_session, SessionHandle};
pub use audio::{
    decode_pcm16_le, decode_wav, load_asset, AssetFormat, AudioError, ChunkReader, DecodedAudio,
};
pub use frame::AudioFrame;
pub use resample::{mixdown, prepare_stream, resample, shape_sample};
pub use scheduler::{
    FramePump, FrameScheduler, PlaybackCursor, SchedulerError, SchedulerEvent, TickOutcome,
};
pub use session::{CallError, CallEvent, CallRole, CallSession, CallState, SessionReceivers};
pub use transport::{
    FrameSink, MediaTransport, TransportError, TransportEvent, TransportEventSender,
    TransportFactory,
};
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};
