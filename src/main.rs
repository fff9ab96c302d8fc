//! pulse-stream - Kommandozeilen-Client
//!
//! Verbindet sich mit dem Relay, liest Befehle von stdin
//! (`call <id>`, `accept`, `reject`, `end`, `peers`, `quit`) und streamt
//! das angegebene Audio-Asset, sobald ein Anruf steht.

use anyhow::Context;
use clap::Parser;
use pulse_stream::call_engine::WebRtcTransportFactory;
use pulse_stream::config::{default_ice_servers, AppConfig, SessionConfig, StreamConfig};
use pulse_stream::signaling::SignalSender;
use pulse_stream::{init_tracing, prepare_audio, CallApp, SignalingClient, UserIntent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream an audio file to a peer over WebRTC", long_about = None)]
struct Args {
    /// Signaling relay (ws, wss, http or https)
    #[arg(long, env = "PULSE_RELAY_URL", default_value = "ws://localhost:8080/ws")]
    relay_url: String,

    /// Audio asset to stream once a call is connected
    #[arg(short, long, env = "PULSE_AUDIO")]
    audio: Option<PathBuf>,

    /// Treat the asset as headerless 16-bit LE PCM with this sample rate
    #[arg(long, value_name = "HZ")]
    raw_pcm_rate: Option<u32>,

    /// Channel count for raw PCM assets
    #[arg(long, default_value_t = 1, requires = "raw_pcm_rate")]
    raw_pcm_channels: u16,

    /// JSON file with stream settings (sample rate, frame size, speed, gain)
    #[arg(long, env = "PULSE_STREAM_CONFIG")]
    stream_config: Option<PathBuf>,

    /// Playback speed, overrides the stream config
    #[arg(long)]
    playback_speed: Option<f64>,

    /// Restart the asset when it runs out
    #[arg(long = "loop")]
    loop_playback: bool,

    /// STUN/TURN server URLs, comma separated
    #[arg(long = "ice-server", env = "PULSE_ICE_SERVERS", value_delimiter = ',')]
    ice_servers: Vec<String>,

    /// Seconds to wait for connectivity after descriptions are exchanged
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Accept incoming calls without asking
    #[arg(long)]
    auto_accept: bool,

    /// Call the first peer in the relay's user list
    #[arg(long)]
    call_first: bool,

    /// Call this peer right after connecting
    #[arg(long, value_name = "PEER_ID")]
    call: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(AppConfig, Option<String>)> {
        let mut stream = match &self.stream_config {
            Some(path) => StreamConfig::load(path)
                .with_context(|| format!("failed to load stream config {:?}", path))?,
            None => StreamConfig::default(),
        };
        if let Some(speed) = self.playback_speed {
            stream.playback_speed = speed;
        }
        stream.loop_playback |= self.loop_playback;
        stream.validate().context("invalid stream config")?;

        let ice_servers = if self.ice_servers.is_empty() {
            default_ice_servers()
        } else {
            self.ice_servers
        };

        let config = AppConfig {
            relay_url: AppConfig::parse_relay_url(&self.relay_url)
                .with_context(|| format!("invalid relay url {}", self.relay_url))?,
            audio_path: self.audio,
            raw_pcm: self.raw_pcm_rate.map(|rate| (rate, self.raw_pcm_channels)),
            ice_servers,
            auto_accept: self.auto_accept,
            call_first: self.call_first,
            session: SessionConfig {
                connect_timeout: Duration::from_secs(self.connect_timeout),
                stream,
            },
        };
        Ok((config, self.call))
    }
}

/// Liest Zeilen von stdin und übersetzt sie in Intents
fn spawn_stdin_reader(intents: mpsc::UnboundedSender<UserIntent>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match UserIntent::parse(&line) {
                Ok(intent) => {
                    if intents.send(intent).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("{}", e),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let (config, call_peer) = Args::parse().into_config()?;
    tracing::info!("Starting pulse-stream, relay {}", config.relay_url);

    // Dekodierfehler betreffen nur das Streaming, nicht das Signaling
    let audio = match prepare_audio(&config) {
        Ok(audio) => audio,
        Err(e) => {
            tracing::error!("Audio asset unusable, calls will carry no audio: {}", e);
            None
        }
    };

    let (client, events) = SignalingClient::connect(config.relay_url.clone())
        .await
        .context("failed to connect to signaling relay")?;
    let signaling: Arc<dyn SignalSender> = Arc::new(client);

    let factory = Arc::new(WebRtcTransportFactory::new(
        config.ice_servers.clone(),
        config.session.stream.target_sample_rate,
    ));

    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    if let Some(peer) = call_peer {
        let _ = intent_tx.send(UserIntent::Call(peer));
    }
    spawn_stdin_reader(intent_tx);

    CallApp::new(&config, signaling, factory, audio)
        .run(events, intent_rx)
        .await;

    Ok(())
}
