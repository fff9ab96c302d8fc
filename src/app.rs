//! Call App - Routing zwischen Relay, Sessions und Benutzer
//!
//! Pro Relay-Verbindung existiert höchstens eine lebende Session. Weitere
//! eingehende Anrufe werden als besetzt abgewiesen.

use crate::call_engine::{
    load_asset, prepare_stream, spawn_session, AssetFormat, CallError, CallEvent, CallSession,
    CallState, SessionHandle, TransportFactory,
};
use crate::config::{AppConfig, SessionConfig};
use crate::signaling::{
    IncomingMessage, OutgoingMessage, SessionDescription, SignalSender, SignalingEvent,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// USER INTENTS
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntentError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Missing peer id, usage: call <peer-id>")]
    MissingPeer,
}

/// Benutzer-Eingaben (eine Zeile pro Intent)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserIntent {
    Call(String),
    Accept,
    Reject,
    End,
    ListPeers,
    Quit,
}

impl UserIntent {
    pub fn parse(line: &str) -> Result<Self, IntentError> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default().to_ascii_lowercase();

        match command.as_str() {
            "call" => words
                .next()
                .map(|peer| UserIntent::Call(peer.to_string()))
                .ok_or(IntentError::MissingPeer),
            "accept" | "answer" => Ok(UserIntent::Accept),
            "reject" | "decline" => Ok(UserIntent::Reject),
            "end" | "hangup" => Ok(UserIntent::End),
            "peers" | "users" => Ok(UserIntent::ListPeers),
            "quit" | "exit" => Ok(UserIntent::Quit),
            _ => Err(IntentError::Unknown(line.trim().to_string())),
        }
    }
}

/// Lädt und bereitet das Audio-Asset einmalig auf
pub fn prepare_audio(config: &AppConfig) -> Result<Option<Arc<[i16]>>, CallError> {
    let Some(path) = &config.audio_path else {
        return Ok(None);
    };

    let format = match config.raw_pcm {
        Some((sample_rate, channels)) => AssetFormat::RawPcm16 {
            sample_rate,
            channels,
        },
        None => AssetFormat::Wav,
    };

    let decoded = load_asset(path, format)?;
    let samples = prepare_stream(&decoded, &config.session.stream);
    Ok(Some(samples.into()))
}

// ============================================================================
// CALL APP
// ============================================================================

pub struct CallApp {
    signaling: Arc<dyn SignalSender>,
    factory: Arc<dyn TransportFactory>,
    audio: Option<Arc<[i16]>>,
    session_config: SessionConfig,
    auto_accept: bool,
    call_first: bool,
    called_first: bool,
    own_id: Option<String>,
    peers: Vec<String>,
    current: Option<SessionHandle>,
}

impl CallApp {
    pub fn new(
        config: &AppConfig,
        signaling: Arc<dyn SignalSender>,
        factory: Arc<dyn TransportFactory>,
        audio: Option<Arc<[i16]>>,
    ) -> Self {
        Self {
            signaling,
            factory,
            audio,
            session_config: config.session.clone(),
            auto_accept: config.auto_accept,
            call_first: config.call_first,
            called_first: false,
            own_id: None,
            peers: Vec::new(),
            current: None,
        }
    }

    /// Eigene Socket-ID (nach `your-id`)
    pub fn own_id(&self) -> Option<&str> {
        self.own_id.as_deref()
    }

    /// Zuletzt gemeldete Teilnehmer, ohne uns selbst
    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Die aktuelle Session, auch wenn sie schon beendet ist
    pub fn current_session(&self) -> Option<&SessionHandle> {
        self.current.as_ref()
    }

    /// Hauptschleife: Relay-Events und Benutzer-Intents bis `quit` oder
    /// Verbindungsverlust.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SignalingEvent>,
        mut intents: mpsc::UnboundedReceiver<UserIntent>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if !self.handle_signaling_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(intent) = intents.recv() => {
                    if intent == UserIntent::Quit {
                        break;
                    }
                    if let Err(e) = self.handle_intent(intent).await {
                        tracing::warn!("{}", e);
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Verarbeitet ein Relay-Event. `false` heißt: Verbindung weg.
    pub async fn handle_signaling_event(&mut self, event: SignalingEvent) -> bool {
        match event {
            SignalingEvent::Connected => {
                tracing::info!("Connected to signaling relay");
                true
            }
            SignalingEvent::Disconnected => {
                tracing::warn!("Lost connection to signaling relay");
                false
            }
            SignalingEvent::Message(message) => {
                self.route_message(message).await;
                true
            }
        }
    }

    /// Führt einen Benutzer-Intent aus
    pub async fn handle_intent(&mut self, intent: UserIntent) -> Result<(), CallError> {
        match intent {
            UserIntent::Call(peer_id) => {
                if let Some(live) = self.live_session() {
                    return Err(CallError::InvalidState {
                        operation: "initiate_call",
                        state: live.state(),
                    });
                }
                let handle = self.open_session();
                handle.initiate_call(peer_id).await
            }
            UserIntent::Accept => self.require_session("accept_call")?.accept_call().await,
            UserIntent::Reject => self.require_session("reject_call")?.reject_call().await,
            UserIntent::End => self.require_session("end_call")?.end_call().await,
            UserIntent::ListPeers => {
                tracing::info!("Own id: {:?}, peers: {:?}", self.own_id, self.peers);
                Ok(())
            }
            UserIntent::Quit => Ok(()),
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn route_message(&mut self, message: IncomingMessage) {
        match message {
            IncomingMessage::YourId { id } => {
                tracing::info!("Relay assigned id {}", id);
                self.own_id = Some(id);
            }
            IncomingMessage::UsersList(users) => {
                let own_id = self.own_id.as_deref();
                self.peers = users
                    .into_iter()
                    .map(|u| u.id)
                    .filter(|id| Some(id.as_str()) != own_id)
                    .collect();
                tracing::info!("Connected users: {:?}", self.peers);
                self.maybe_call_first().await;
            }
            IncomingMessage::IncomingCall { from, signal } => {
                self.on_incoming_call(from, signal).await;
            }
            other => match self.live_session() {
                Some(handle) => {
                    let kind = other.kind();
                    if let Err(e) = handle.handle_signal(other).await {
                        tracing::warn!("Ignoring {}: {}", kind, e);
                    }
                }
                None => tracing::debug!("No live session for {}", other.kind()),
            },
        }
    }

    async fn on_incoming_call(&mut self, from: String, offer: SessionDescription) {
        if self.live_session().is_some() {
            tracing::warn!("Busy, rejecting call from {}", from);
            if let Err(e) = self.signaling.send(&OutgoingMessage::RejectCall { to: from }) {
                tracing::error!("Failed to reject busy call: {}", e);
            }
            return;
        }

        let handle = self.open_session();
        let message = IncomingMessage::IncomingCall {
            from: from.clone(),
            signal: offer,
        };
        if let Err(e) = handle.handle_signal(message).await {
            tracing::warn!("Incoming call from {} failed: {}", from, e);
            return;
        }

        if self.auto_accept {
            if let Err(e) = handle.accept_call().await {
                tracing::error!("Failed to accept call from {}: {}", from, e);
            }
        } else {
            tracing::info!("Incoming call from {} (accept / reject)", from);
        }
    }

    async fn maybe_call_first(&mut self) {
        if !self.call_first || self.called_first || self.live_session().is_some() {
            return;
        }
        let Some(peer_id) = self.peers.first().cloned() else {
            return;
        };

        self.called_first = true;
        tracing::info!("Calling first available peer {}", peer_id);
        if let Err(e) = self.handle_intent(UserIntent::Call(peer_id)).await {
            tracing::error!("Call to first peer failed: {}", e);
        }
    }

    /// Lebende Session; beendete werden dabei vergessen
    fn live_session(&mut self) -> Option<SessionHandle> {
        if self.current.as_ref().is_some_and(SessionHandle::is_terminal) {
            self.current = None;
        }
        self.current.clone()
    }

    fn require_session(&mut self, operation: &'static str) -> Result<SessionHandle, CallError> {
        self.live_session().ok_or(CallError::InvalidState {
            operation,
            state: CallState::Idle,
        })
    }

    fn open_session(&mut self) -> SessionHandle {
        let (session, receivers) = CallSession::new(
            Arc::clone(&self.signaling),
            Arc::clone(&self.factory),
            self.audio.clone(),
            self.session_config.clone(),
        );
        let handle = spawn_session(session, receivers);
        Self::log_events(&handle);
        self.current = Some(handle.clone());
        handle
    }

    /// Session-Events loggen, bis die Session terminal ist
    fn log_events(handle: &SessionHandle) {
        let mut events = handle.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    CallEvent::StateChanged(state) => {
                        tracing::info!("Call state changed: {:?}", state);
                        if state.is_terminal() {
                            break;
                        }
                    }
                    CallEvent::StreamFinished { frames, dropped } => {
                        tracing::info!("Finished streaming {} frames ({} dropped)", frames, dropped);
                    }
                    CallEvent::Error(err) => {
                        tracing::error!("Call error: {}", err);
                    }
                }
            }
        });
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.live_session() {
            if let Err(e) = handle.end_call().await {
                tracing::warn!("Failed to end call on shutdown: {}", e);
            }
        }
        tracing::info!("Call app stopped");
    }
}
