//! Call Session State Machine
//!
//! Eine `CallSession` besitzt genau einen Anruf: Zustand, Descriptions,
//! Candidate-Queues, Transport und Frame Scheduler. Alle Übergänge laufen
//! über `&mut self`, der Besitzer serialisiert also automatisch (siehe
//! `actor`).
//!
//! ```text
//! Idle ─call─► Outgoing ──call-accepted──► Connecting ─connected─► Connected ─► Ended
//! Idle ─incoming-call─► IncomingRinging ─accept─► Connecting
//! (jeder nicht-terminale Zustand) ─Fehler─► Failed
//! ```

use super::scheduler::{FramePump, FrameScheduler, SchedulerEvent};
use super::transport::{MediaTransport, TransportError, TransportEvent, TransportFactory};
use crate::call_engine::audio::AudioError;
use crate::config::SessionConfig;
use crate::signaling::{
    DescriptionKind, IceCandidate, IncomingMessage, OutgoingMessage, SessionDescription,
    SignalSender, SignalingError,
};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("'{operation}' is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    #[error("Signaling delivery failed: {0}")]
    SignalingDelivery(SignalingError),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Audio decode failed: {0}")]
    Decode(#[from] AudioError),

    #[error("Audio delivery failed {consecutive_failures} times in a row")]
    DeliveryDropped { consecutive_failures: u32 },
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        CallError::Negotiation(e.to_string())
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Zustand einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Noch kein Anruf
    Idle,
    /// Ausgehender Anruf, Offer ist raus
    Outgoing,
    /// Eingehender Anruf wartet auf Antwort
    IncomingRinging,
    /// Descriptions ausgetauscht, warte auf Konnektivität
    Connecting,
    /// Anruf aktiv
    Connected,
    /// Regulär beendet
    Ended,
    /// Abgebrochen wegen Fehler oder Ablehnung
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Erlaubte Übergänge; terminale Zustände haben keine
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Ended | Failed, _) => false,
            (_, Ended | Failed) => true,
            (Idle, Outgoing | IncomingRinging) => true,
            (Outgoing | IncomingRinging, Connecting) => true,
            (Connecting, Connected) => true,
            _ => false,
        }
    }
}

/// Rolle in der Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Events die von der Session ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(CallState),
    StreamFinished { frames: u64, dropped: u64 },
    Error(CallError),
}

/// Empfänger, die der Besitzer der Session abfragen muss
pub struct SessionReceivers {
    pub transport: mpsc::UnboundedReceiver<TransportEvent>,
    pub scheduler: mpsc::UnboundedReceiver<SchedulerEvent>,
}

/// Nachrichten, die aus dem aktuellen Zustand abgeleitet werden
#[derive(Debug, Clone)]
enum Outbound {
    CallUser,
    AnswerCall,
    RejectCall,
    EndCall,
    Candidate(IceCandidate),
}

#[derive(Debug, Clone)]
struct RemoteCandidate {
    from: String,
    candidate: IceCandidate,
}

// ============================================================================
// CALL SESSION
// ============================================================================

pub struct CallSession {
    peer_id: Option<String>,
    role: Option<CallRole>,
    state: CallState,

    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_applied: bool,
    local_sent: bool,

    pending_local_candidates: VecDeque<IceCandidate>,
    pending_remote_candidates: VecDeque<RemoteCandidate>,
    applied_remote_candidates: usize,

    transport: Option<Arc<dyn MediaTransport>>,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalSender>,
    transport_events: mpsc::UnboundedSender<TransportEvent>,

    scheduler: FrameScheduler,
    scheduler_events: mpsc::UnboundedSender<SchedulerEvent>,
    audio: Option<Arc<[i16]>>,
    stream_started: bool,

    config: SessionConfig,
    connecting_since: Option<Instant>,

    state_tx: watch::Sender<CallState>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallSession {
    /// Erstellt eine Session im Zustand `Idle`.
    ///
    /// `audio` sind bereits vorbereitete Mono-Samples in Ziel-Rate; ohne
    /// Audio wird nach dem Verbinden nichts gestreamt.
    pub fn new(
        signaling: Arc<dyn SignalSender>,
        factory: Arc<dyn TransportFactory>,
        audio: Option<Arc<[i16]>>,
        config: SessionConfig,
    ) -> (Self, SessionReceivers) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(CallState::Idle);
        let (event_tx, _) = broadcast::channel(100);

        let session = Self {
            peer_id: None,
            role: None,
            state: CallState::Idle,
            local_description: None,
            remote_description: None,
            remote_applied: false,
            local_sent: false,
            pending_local_candidates: VecDeque::new(),
            pending_remote_candidates: VecDeque::new(),
            applied_remote_candidates: 0,
            transport: None,
            factory,
            signaling,
            transport_events: transport_tx,
            scheduler: FrameScheduler::new(),
            scheduler_events: scheduler_tx,
            audio,
            stream_started: false,
            config,
            connecting_since: None,
            state_tx,
            event_tx,
        };

        (
            session,
            SessionReceivers {
                transport: transport_rx,
                scheduler: scheduler_rx,
            },
        )
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn role(&self) -> Option<CallRole> {
        self.role
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_local_candidates(&self) -> usize {
        self.pending_local_candidates.len()
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn applied_remote_candidates(&self) -> usize {
        self.applied_remote_candidates
    }

    pub fn is_streaming(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<CallEvent> {
        self.event_tx.clone()
    }

    /// Deadline für den Verbindungsaufbau, nur solange `Connecting`
    pub fn connect_deadline(&self) -> Option<Instant> {
        match self.state {
            CallState::Connecting => self
                .connecting_since
                .map(|since| since + self.config.connect_timeout),
            _ => None,
        }
    }

    // ========================================================================
    // USER INTENTS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    pub async fn initiate_call(&mut self, peer_id: &str) -> Result<(), CallError> {
        self.ensure_state(&[CallState::Idle], "initiate_call")?;

        tracing::info!("Calling {}", peer_id);
        self.peer_id = Some(peer_id.to_string());
        self.role = Some(CallRole::Caller);
        // Candidates anderer Peers aus der Idle-Phase gehören nicht zu diesem Anruf
        self.pending_remote_candidates.retain(|c| c.from == peer_id);

        let transport = self.open_transport().await?;

        let result = transport.create_local_description(true).await;
        let offer = self.negotiated(result).await?;
        let result = transport.apply_local_description(&offer).await;
        self.negotiated(result).await?;
        self.local_description = Some(offer);

        self.set_state(CallState::Outgoing);
        self.deliver(Outbound::CallUser).await?;
        self.local_sent = true;

        self.flush_local_candidates().await
    }

    /// Nimmt den eingehenden Anruf an
    pub async fn accept_call(&mut self) -> Result<(), CallError> {
        self.ensure_state(&[CallState::IncomingRinging], "accept_call")?;

        let offer = self
            .remote_description
            .clone()
            .ok_or(CallError::InvalidState {
                operation: "accept_call",
                state: self.state,
            })?;

        tracing::info!("Accepting call from {:?}", self.peer_id);
        let transport = self.open_transport().await?;

        let result = transport.apply_remote_description(&offer).await;
        self.negotiated(result).await?;
        self.remote_applied = true;
        self.flush_remote_candidates().await?;

        let result = transport.create_local_description(true).await;
        let answer = self.negotiated(result).await?;
        let result = transport.apply_local_description(&answer).await;
        self.negotiated(result).await?;
        self.local_description = Some(answer);

        self.set_state(CallState::Connecting);
        self.deliver(Outbound::AnswerCall).await?;
        self.local_sent = true;

        self.flush_local_candidates().await
    }

    /// Lehnt den eingehenden Anruf ab
    pub async fn reject_call(&mut self) -> Result<(), CallError> {
        self.ensure_state(&[CallState::IncomingRinging], "reject_call")?;

        tracing::info!("Rejecting call from {:?}", self.peer_id);
        self.deliver(Outbound::RejectCall).await?;
        self.teardown().await;
        self.set_state(CallState::Ended);
        Ok(())
    }

    /// Beendet den Anruf lokal und informiert die Gegenseite
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        self.ensure_active("end_call")?;

        tracing::info!("Hanging up on {:?}", self.peer_id);
        self.scheduler.stop().await;
        if self.peer_id.is_some() {
            self.deliver(Outbound::EndCall).await?;
        }
        self.teardown().await;
        self.set_state(CallState::Ended);
        Ok(())
    }

    // ========================================================================
    // SIGNALING EVENTS
    // ========================================================================

    /// Verarbeitet eine Nachricht vom Relay
    pub async fn handle_signal(&mut self, message: IncomingMessage) -> Result<(), CallError> {
        match message {
            IncomingMessage::IncomingCall { from, signal } => self.on_incoming_call(from, signal).await,
            IncomingMessage::CallAccepted { signal } => self.on_call_accepted(signal).await,
            IncomingMessage::CallRejected => self.on_call_declined("call-rejected").await,
            IncomingMessage::UserBusy => self.on_call_declined("user-busy").await,
            IncomingMessage::IceCandidate { from, candidate } => {
                self.on_remote_candidate(from, candidate).await
            }
            IncomingMessage::CallEnded => self.on_remote_end().await,
            IncomingMessage::YourId { .. } | IncomingMessage::UsersList(_) => Ok(()),
        }
    }

    async fn on_incoming_call(
        &mut self,
        from: String,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        self.ensure_state(&[CallState::Idle], "incoming-call")?;

        tracing::info!("Incoming call from {}", from);
        self.pending_remote_candidates.retain(|c| c.from == from);
        self.peer_id = Some(from);
        self.role = Some(CallRole::Callee);

        if offer.kind != DescriptionKind::Offer {
            return Err(self
                .fail(CallError::Negotiation(
                    "incoming call did not carry an offer".to_string(),
                ))
                .await);
        }

        // Offer wird erst bei accept_call angewendet
        self.remote_description = Some(offer);
        self.set_state(CallState::IncomingRinging);
        Ok(())
    }

    async fn on_call_accepted(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        self.ensure_state(&[CallState::Outgoing], "call-accepted")?;
        if self.remote_description.is_some() {
            return Err(CallError::InvalidState {
                operation: "call-accepted",
                state: self.state,
            });
        }

        tracing::info!("Call accepted by {:?}", self.peer_id);
        let transport = self.current_transport("call-accepted")?;
        let result = transport.apply_remote_description(&answer).await;
        self.negotiated(result).await?;
        self.remote_description = Some(answer);
        self.remote_applied = true;

        self.set_state(CallState::Connecting);
        self.flush_remote_candidates().await
    }

    async fn on_call_declined(&mut self, reason: &'static str) -> Result<(), CallError> {
        self.ensure_state(
            &[CallState::Outgoing, CallState::IncomingRinging],
            reason,
        )?;

        tracing::info!("Call declined by {:?} ({})", self.peer_id, reason);
        self.teardown().await;
        self.set_state(CallState::Ended);
        Ok(())
    }

    async fn on_remote_candidate(
        &mut self,
        from: String,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        self.ensure_active("ice-candidate")?;

        if let Some(peer) = &self.peer_id {
            if *peer != from {
                tracing::warn!("Dropping candidate from {} (session peer is {})", from, peer);
                return Ok(());
            }
        }

        if self.remote_applied {
            tracing::debug!("Applying remote candidate from {}", from);
            self.apply_remote_candidate(candidate).await
        } else {
            tracing::debug!("Queueing remote candidate from {}", from);
            self.pending_remote_candidates
                .push_back(RemoteCandidate { from, candidate });
            Ok(())
        }
    }

    async fn on_remote_end(&mut self) -> Result<(), CallError> {
        self.ensure_active("call-ended")?;

        tracing::info!("Call ended by {:?}", self.peer_id);
        self.teardown().await;
        self.set_state(CallState::Ended);
        Ok(())
    }

    // ========================================================================
    // TRANSPORT & SCHEDULER EVENTS
    // ========================================================================

    /// Verarbeitet ein Event des Transports
    pub async fn on_transport_event(&mut self, event: TransportEvent) -> Result<(), CallError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.state.is_terminal() {
                    tracing::debug!("Ignoring local candidate after teardown");
                    return Ok(());
                }
                self.pending_local_candidates.push_back(candidate);
                self.flush_local_candidates().await
            }
            TransportEvent::ConnectivityEstablished => {
                if self.state != CallState::Connecting {
                    tracing::debug!("Connectivity established in state {:?}", self.state);
                    return Ok(());
                }
                self.set_state(CallState::Connected);
                self.start_stream()
            }
            TransportEvent::ConnectivityFailed(reason) => {
                if self.state.is_terminal() {
                    return Ok(());
                }
                Err(self.fail(CallError::Negotiation(reason)).await)
            }
            TransportEvent::Closed => {
                if self.state.is_terminal() {
                    return Ok(());
                }
                tracing::info!("Transport closed, ending session");
                self.teardown().await;
                self.set_state(CallState::Ended);
                Ok(())
            }
        }
    }

    /// Verarbeitet eine Meldung des Frame Schedulers
    pub async fn on_scheduler_event(&mut self, event: SchedulerEvent) -> Result<(), CallError> {
        match event {
            SchedulerEvent::Finished { frames, dropped } => {
                tracing::info!("Audio stream finished: {} frames, {} dropped", frames, dropped);
                let _ = self
                    .event_tx
                    .send(CallEvent::StreamFinished { frames, dropped });
                Ok(())
            }
            SchedulerEvent::Failed {
                consecutive_failures,
            } => {
                if self.state.is_terminal() {
                    return Ok(());
                }
                Err(self
                    .fail(CallError::DeliveryDropped {
                        consecutive_failures,
                    })
                    .await)
            }
        }
    }

    /// Wird aufgerufen, wenn `connect_deadline` verstrichen ist
    pub async fn connectivity_timed_out(&mut self) -> Result<(), CallError> {
        if self.state != CallState::Connecting {
            return Ok(());
        }
        let timeout = self.config.connect_timeout;
        Err(self
            .fail(CallError::Negotiation(format!(
                "connectivity not established within {:?}",
                timeout
            )))
            .await)
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn ensure_state(&self, allowed: &[CallState], operation: &'static str) -> Result<(), CallError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CallError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn ensure_active(&self, operation: &'static str) -> Result<(), CallError> {
        if self.state.is_terminal() {
            Err(CallError::InvalidState {
                operation,
                state: self.state,
            })
        } else {
            Ok(())
        }
    }

    fn current_transport(&self, operation: &'static str) -> Result<Arc<dyn MediaTransport>, CallError> {
        self.transport.clone().ok_or(CallError::InvalidState {
            operation,
            state: self.state,
        })
    }

    async fn open_transport(&mut self) -> Result<Arc<dyn MediaTransport>, CallError> {
        let result = self
            .factory
            .create(self.transport_events.clone(), self.audio.is_some())
            .await;
        let transport = self.negotiated(result).await?;
        self.transport = Some(Arc::clone(&transport));
        Ok(transport)
    }

    /// Fehler bei Description/Candidate-Anwendung sind fatal für die Session
    async fn negotiated<T>(&mut self, result: Result<T, TransportError>) -> Result<T, CallError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e.into()).await),
        }
    }

    async fn apply_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        let transport = self.current_transport("ice-candidate")?;
        let result = transport.add_remote_candidate(&candidate).await;
        self.negotiated(result).await?;
        self.applied_remote_candidates += 1;
        Ok(())
    }

    /// Gepufferte Remote Candidates in Ankunftsreihenfolge anwenden
    async fn flush_remote_candidates(&mut self) -> Result<(), CallError> {
        if !self.pending_remote_candidates.is_empty() {
            tracing::debug!(
                "Applying {} queued remote candidate(s)",
                self.pending_remote_candidates.len()
            );
        }
        while let Some(queued) = self.pending_remote_candidates.pop_front() {
            self.apply_remote_candidate(queued.candidate).await?;
        }
        Ok(())
    }

    /// Lokale Candidates erst senden, wenn die Gegenseite unsere Description hat
    async fn flush_local_candidates(&mut self) -> Result<(), CallError> {
        if !self.local_sent {
            tracing::debug!(
                "Holding {} local candidate(s) until description is sent",
                self.pending_local_candidates.len()
            );
            return Ok(());
        }
        while let Some(candidate) = self.pending_local_candidates.pop_front() {
            self.deliver(Outbound::Candidate(candidate)).await?;
        }
        Ok(())
    }

    /// Baut die Nachricht aus dem aktuellen Zustand; `None` wenn sie nicht mehr passt
    fn derive_message(&self, outbound: &Outbound) -> Option<OutgoingMessage> {
        let to = self.peer_id.clone()?;
        match outbound {
            Outbound::CallUser => match (self.state, &self.local_description) {
                (CallState::Outgoing, Some(offer)) => Some(OutgoingMessage::CallUser {
                    user_to_call: to,
                    signal_data: offer.clone(),
                }),
                _ => None,
            },
            Outbound::AnswerCall => match (self.state, &self.local_description) {
                (CallState::Connecting | CallState::Connected, Some(answer))
                    if self.role == Some(CallRole::Callee) =>
                {
                    Some(OutgoingMessage::AnswerCall {
                        to,
                        signal: answer.clone(),
                    })
                }
                _ => None,
            },
            Outbound::RejectCall => (self.state == CallState::IncomingRinging)
                .then_some(OutgoingMessage::RejectCall { to }),
            Outbound::EndCall => {
                (!self.state.is_terminal()).then_some(OutgoingMessage::EndCall { to })
            }
            Outbound::Candidate(candidate) => {
                (!self.state.is_terminal()).then(|| OutgoingMessage::IceCandidate {
                    to,
                    candidate: candidate.clone(),
                })
            }
        }
    }

    /// Sendet eine Nachricht; bei Fehler genau ein neuer Versuch mit neu
    /// abgeleiteter Nachricht. Scheitert auch der, ist die Session `Failed`.
    async fn deliver(&mut self, outbound: Outbound) -> Result<(), CallError> {
        let Some(message) = self.derive_message(&outbound) else {
            tracing::debug!("Skipping {:?}: no longer valid in {:?}", outbound, self.state);
            return Ok(());
        };

        let first_error = match self.signaling.send(&message) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        tracing::warn!("Failed to send {}: {}, retrying once", message.kind(), first_error);

        let Some(message) = self.derive_message(&outbound) else {
            return Ok(());
        };
        match self.signaling.send(&message) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(CallError::SignalingDelivery(e)).await),
        }
    }

    fn start_stream(&mut self) -> Result<(), CallError> {
        if self.stream_started {
            return Ok(());
        }
        let (Some(audio), Some(transport)) = (self.audio.clone(), self.transport.clone()) else {
            tracing::info!("Connected without an audio source, nothing to stream");
            return Ok(());
        };

        let pump = FramePump::new(audio, self.config.stream.clone());
        self.scheduler
            .start(pump, transport, self.scheduler_events.clone())
            .map_err(|_| CallError::InvalidState {
                operation: "start_stream",
                state: self.state,
            })?;
        self.stream_started = true;
        Ok(())
    }

    /// Scheduler stoppen, Transport schließen, Queues leeren. Idempotent.
    async fn teardown(&mut self) {
        self.scheduler.stop().await;

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!("Failed to close transport: {}", e);
            }
        }

        self.pending_local_candidates.clear();
        self.pending_remote_candidates.clear();
        self.connecting_since = None;
    }

    /// Fatale Fehler: aufräumen, `Failed`, Fehler melden
    async fn fail(&mut self, error: CallError) -> CallError {
        tracing::error!("Call session with {:?} failed: {}", self.peer_id, error);
        self.teardown().await;
        if !self.state.is_terminal() {
            let _ = self.event_tx.send(CallEvent::Error(error.clone()));
        }
        self.set_state(CallState::Failed);
        error
    }

    /// Aktualisiert den State und sendet Event
    fn set_state(&mut self, next: CallState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!("Ignoring transition {:?} -> {:?}", self.state, next);
            return;
        }
        tracing::info!("Call state: {:?} -> {:?}", self.state, next);
        self.state = next;
        if next == CallState::Connecting {
            self.connecting_since = Some(Instant::now());
        }
        self.state_tx.send_replace(next);
        let _ = self.event_tx.send(CallEvent::StateChanged(next));
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            tracing::warn!("Call session dropped with a live transport, closing it");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = transport.close().await;
                });
            }
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pending_local", &self.pending_local_candidates.len())
            .field("pending_remote", &self.pending_remote_candidates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::frame::AudioFrame;
    use crate::call_engine::transport::{FrameSink, TransportEventSender};
    use crate::config::StreamConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    // ------------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct MockSignaling {
        sent: Mutex<Vec<OutgoingMessage>>,
        fail_next: Mutex<u32>,
    }

    impl MockSignaling {
        fn sent(&self) -> Vec<OutgoingMessage> {
            self.sent.lock().clone()
        }

        fn fail_next(&self, count: u32) {
            *self.fail_next.lock() = count;
        }
    }

    impl SignalSender for MockSignaling {
        fn send(&self, message: &OutgoingMessage) -> Result<(), SignalingError> {
            let mut fail = self.fail_next.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(SignalingError::SendFailed("relay unavailable".to_string()));
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockTransport {
        local: Mutex<Option<SessionDescription>>,
        remote: Mutex<Option<SessionDescription>>,
        candidates: Mutex<Vec<IceCandidate>>,
        frames: Mutex<Vec<AudioFrame>>,
        closed: AtomicBool,
        reject_remote: bool,
    }

    #[async_trait]
    impl FrameSink for MockTransport {
        async fn push_audio_frame(&self, frame: &AudioFrame) -> Result<(), TransportError> {
            self.frames.lock().push(frame.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl MediaTransport for MockTransport {
        async fn create_local_description(
            &self,
            _want_audio: bool,
        ) -> Result<SessionDescription, TransportError> {
            if self.remote.lock().is_some() {
                Ok(SessionDescription::answer("answer-sdp"))
            } else {
                Ok(SessionDescription::offer("offer-sdp"))
            }
        }

        async fn apply_local_description(
            &self,
            description: &SessionDescription,
        ) -> Result<(), TransportError> {
            *self.local.lock() = Some(description.clone());
            Ok(())
        }

        async fn apply_remote_description(
            &self,
            description: &SessionDescription,
        ) -> Result<(), TransportError> {
            if self.reject_remote {
                return Err(TransportError::Negotiation("malformed sdp".to_string()));
            }
            *self.remote.lock() = Some(description.clone());
            Ok(())
        }

        async fn add_remote_candidate(
            &self,
            candidate: &IceCandidate,
        ) -> Result<(), TransportError> {
            if self.remote.lock().is_none() {
                return Err(TransportError::InvalidCandidate(
                    "remote description not set".to_string(),
                ));
            }
            self.candidates.lock().push(candidate.clone());
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockFactory {
        transport: Arc<MockTransport>,
        created: AtomicUsize,
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn create(
            &self,
            _events: TransportEventSender,
            _send_audio: bool,
        ) -> Result<Arc<dyn MediaTransport>, TransportError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&self.transport) as Arc<dyn MediaTransport>)
        }
    }

    struct Fixture {
        session: CallSession,
        _receivers: SessionReceivers,
        signaling: Arc<MockSignaling>,
        factory: Arc<MockFactory>,
        transport: Arc<MockTransport>,
    }

    fn fixture_with(transport: MockTransport, audio: Option<Arc<[i16]>>) -> Fixture {
        let signaling = Arc::new(MockSignaling::default());
        let transport = Arc::new(transport);
        let factory = Arc::new(MockFactory {
            transport: Arc::clone(&transport),
            created: AtomicUsize::new(0),
        });
        let (session, receivers) = CallSession::new(
            Arc::clone(&signaling) as Arc<dyn SignalSender>,
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            audio,
            SessionConfig::default(),
        );
        Fixture {
            session,
            _receivers: receivers,
            signaling,
            factory,
            transport,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockTransport::default(), None)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n))
    }

    fn remote_candidate(from: &str, n: u32) -> IncomingMessage {
        IncomingMessage::IceCandidate {
            from: from.to_string(),
            candidate: candidate(n),
        }
    }

    fn incoming_call(from: &str) -> IncomingMessage {
        IncomingMessage::IncomingCall {
            from: from.to_string(),
            signal: SessionDescription::offer("remote-offer"),
        }
    }

    // ------------------------------------------------------------------------
    // Caller
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_initiate_call_sends_offer() {
        let mut f = fixture();
        f.session.initiate_call("peer-b").await.unwrap();

        assert_eq!(f.session.state(), CallState::Outgoing);
        assert_eq!(f.session.role(), Some(CallRole::Caller));
        assert_eq!(
            f.signaling.sent(),
            vec![OutgoingMessage::CallUser {
                user_to_call: "peer-b".to_string(),
                signal_data: SessionDescription::offer("offer-sdp"),
            }]
        );
        assert_eq!(
            *f.transport.local.lock(),
            Some(SessionDescription::offer("offer-sdp"))
        );
    }

    #[tokio::test]
    async fn test_candidates_before_answer_are_applied_in_order() {
        let mut f = fixture();
        f.session.initiate_call("peer-b").await.unwrap();

        for n in 1..=3 {
            f.session
                .handle_signal(remote_candidate("peer-b", n))
                .await
                .unwrap();
        }
        assert_eq!(f.session.pending_remote_candidates(), 3);
        assert!(f.transport.candidates.lock().is_empty());

        f.session
            .handle_signal(IncomingMessage::CallAccepted {
                signal: SessionDescription::answer("remote-answer"),
            })
            .await
            .unwrap();

        assert_eq!(f.session.state(), CallState::Connecting);
        assert_eq!(
            *f.transport.candidates.lock(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
        assert_eq!(f.session.pending_remote_candidates(), 0);

        // Nach dem Anwenden direkt durchreichen, nie erneut puffern
        f.session
            .handle_signal(remote_candidate("peer-b", 4))
            .await
            .unwrap();
        assert_eq!(f.transport.candidates.lock().len(), 4);
        assert_eq!(f.session.applied_remote_candidates(), 4);
    }

    #[tokio::test]
    async fn test_candidates_from_other_peers_are_dropped() {
        let mut f = fixture();
        f.session.initiate_call("peer-b").await.unwrap();
        f.session
            .handle_signal(remote_candidate("intruder", 1))
            .await
            .unwrap();
        assert_eq!(f.session.pending_remote_candidates(), 0);
    }

    #[tokio::test]
    async fn test_local_candidates_flow_after_offer_is_sent() {
        let mut f = fixture();
        f.session.initiate_call("peer-b").await.unwrap();
        f.session
            .on_transport_event(TransportEvent::LocalCandidate(candidate(7)))
            .await
            .unwrap();

        assert_eq!(f.session.pending_local_candidates(), 0);
        assert_eq!(
            f.signaling.sent().last(),
            Some(&OutgoingMessage::IceCandidate {
                to: "peer-b".to_string(),
                candidate: candidate(7),
            })
        );
    }

    #[tokio::test]
    async fn test_rejected_call_ends_and_releases_transport() {
        for declined in [IncomingMessage::CallRejected, IncomingMessage::UserBusy] {
            let mut f = fixture();
            f.session.initiate_call("peer-b").await.unwrap();
            f.session.handle_signal(declined).await.unwrap();

            assert_eq!(f.session.state(), CallState::Ended);
            assert!(f.transport.closed.load(Ordering::SeqCst));
            assert!(!f.session.has_transport());
        }
    }

    // ------------------------------------------------------------------------
    // Callee
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_incoming_call_rings_without_applying_offer() {
        let mut f = fixture();
        f.session.handle_signal(incoming_call("peer-a")).await.unwrap();

        assert_eq!(f.session.state(), CallState::IncomingRinging);
        assert_eq!(f.session.peer_id(), Some("peer-a"));
        assert_eq!(f.factory.created.load(Ordering::SeqCst), 0);
        assert!(f.transport.remote.lock().is_none());
    }

    #[tokio::test]
    async fn test_accept_applies_offer_then_queued_candidates_then_answers() {
        let mut f = fixture();
        f.session.handle_signal(incoming_call("peer-a")).await.unwrap();
        f.session
            .handle_signal(remote_candidate("peer-a", 1))
            .await
            .unwrap();
        f.session
            .handle_signal(remote_candidate("peer-a", 2))
            .await
            .unwrap();

        // Lokaler Candidate vor dem Answer wird zurückgehalten
        f.session
            .on_transport_event(TransportEvent::LocalCandidate(candidate(9)))
            .await
            .unwrap();
        assert_eq!(f.session.pending_local_candidates(), 1);
        assert!(f.signaling.sent().is_empty());

        f.session.accept_call().await.unwrap();

        assert_eq!(f.session.state(), CallState::Connecting);
        assert_eq!(
            *f.transport.remote.lock(),
            Some(SessionDescription::offer("remote-offer"))
        );
        assert_eq!(*f.transport.candidates.lock(), vec![candidate(1), candidate(2)]);
        assert_eq!(
            f.signaling.sent(),
            vec![
                OutgoingMessage::AnswerCall {
                    to: "peer-a".to_string(),
                    signal: SessionDescription::answer("answer-sdp"),
                },
                OutgoingMessage::IceCandidate {
                    to: "peer-a".to_string(),
                    candidate: candidate(9),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_reject_call_never_opens_transport() {
        let mut f = fixture();
        f.session.handle_signal(incoming_call("peer-a")).await.unwrap();
        f.session.reject_call().await.unwrap();

        assert_eq!(f.session.state(), CallState::Ended);
        assert_eq!(
            f.signaling.sent(),
            vec![OutgoingMessage::RejectCall {
                to: "peer-a".to_string()
            }]
        );
        assert_eq!(f.factory.created.load(Ordering::SeqCst), 0);
    }

    // ------------------------------------------------------------------------
    // Terminal states
    // ------------------------------------------------------------------------

    async fn assert_everything_rejected(session: &mut CallSession) {
        let terminal = session.state();
        assert!(terminal.is_terminal());

        let results = vec![
            session.initiate_call("peer-z").await,
            session.accept_call().await,
            session.reject_call().await,
            session.end_call().await,
            session.handle_signal(incoming_call("peer-z")).await,
            session
                .handle_signal(IncomingMessage::CallAccepted {
                    signal: SessionDescription::answer("late"),
                })
                .await,
            session.handle_signal(IncomingMessage::CallRejected).await,
            session.handle_signal(IncomingMessage::UserBusy).await,
            session.handle_signal(remote_candidate("peer-b", 1)).await,
            session.handle_signal(IncomingMessage::CallEnded).await,
        ];

        for result in results {
            assert!(
                matches!(result, Err(CallError::InvalidState { state, .. }) if state == terminal),
                "unexpected result {:?}",
                result
            );
        }
        assert_eq!(session.state(), terminal);
    }

    #[tokio::test]
    async fn test_ended_session_rejects_every_operation() {
        let mut f = fixture();
        f.session.initiate_call("peer-b").await.unwrap();
        f.session.end_call().await.unwrap();

        assert_eq!(
            f.signaling.sent().last(),
            Some(&OutgoingMessage::EndCall {
                to: "peer-b".to_string()
            })
        );
        assert_everything_rejected(&mut f.session).await;

        // Spät eintreffende Transport-Events ändern nichts mehr
        f.session
            .on_transport_event(TransportEvent::ConnectivityEstablished)
            .await
            .unwrap();
        assert_eq!(f.session.state(), CallState::Ended);
    }

    #[tokio::test]
    async fn test_failed_session_rejects_every_operation() {
        let mut f = fixture_with(
            MockTransport {
                reject_remote: true,
                ..Default::default()
            },
            None,
        );
        f.session.initiate_call("peer-b").await.unwrap();

        let result = f
            .session
            .handle_signal(IncomingMessage::CallAccepted {
                signal: SessionDescription::answer("broken"),
            })
            .await;

        assert!(matches!(result, Err(CallError::Negotiation(_))));
        assert_eq!(f.session.state(), CallState::Failed);
        assert!(f.transport.closed.load(Ordering::SeqCst));
        assert_everything_rejected(&mut f.session).await;
    }

    #[tokio::test]
    async fn test_operations_in_wrong_state_are_invalid() {
        let mut f = fixture();
        assert!(matches!(
            f.session.accept_call().await,
            Err(CallError::InvalidState {
                state: CallState::Idle,
                ..
            })
        ));

        f.session.initiate_call("peer-b").await.unwrap();
        assert!(matches!(
            f.session.initiate_call("peer-c").await,
            Err(CallError::InvalidState {
                state: CallState::Outgoing,
                ..
            })
        ));
        assert_eq!(f.session.peer_id(), Some("peer-b"));
    }

    #[tokio::test]
    async fn test_failure_is_published_on_event_channel() {
        let mut f = fixture_with(
            MockTransport {
                reject_remote: true,
                ..Default::default()
            },
            None,
        );
        let mut events = f.session.subscribe();
        f.session.handle_signal(incoming_call("peer-a")).await.unwrap();
        let _ = f.session.accept_call().await;

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Error(CallError::Negotiation(_)) = event {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    // ------------------------------------------------------------------------
    // Signaling failures
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_single_send_failure_is_retried() {
        let mut f = fixture();
        f.signaling.fail_next(1);
        f.session.initiate_call("peer-b").await.unwrap();

        assert_eq!(f.session.state(), CallState::Outgoing);
        assert_eq!(f.signaling.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_second_send_failure_fails_session() {
        let mut f = fixture();
        f.signaling.fail_next(2);
        let result = f.session.initiate_call("peer-b").await;

        assert!(matches!(result, Err(CallError::SignalingDelivery(_))));
        assert_eq!(f.session.state(), CallState::Failed);
        assert!(f.transport.closed.load(Ordering::SeqCst));
        assert!(f.signaling.sent().is_empty());
    }

    // ------------------------------------------------------------------------
    // Connectivity & streaming
    // ------------------------------------------------------------------------

    async fn connected_caller(audio_len: usize) -> Fixture {
        let audio: Arc<[i16]> = vec![100i16; audio_len].into();
        let mut f = fixture_with(MockTransport::default(), Some(audio));
        f.session.initiate_call("peer-b").await.unwrap();
        f.session
            .handle_signal(IncomingMessage::CallAccepted {
                signal: SessionDescription::answer("remote-answer"),
            })
            .await
            .unwrap();
        f.session
            .on_transport_event(TransportEvent::ConnectivityEstablished)
            .await
            .unwrap();
        f
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_starts_exactly_one_stream() {
        let mut f = connected_caller(StreamConfig::default().frame_sample_count * 1000).await;
        assert_eq!(f.session.state(), CallState::Connected);
        assert!(f.session.is_streaming());

        // Ein zweites Connected-Event startet keinen weiteren Scheduler
        f.session
            .on_transport_event(TransportEvent::ConnectivityEstablished)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(95)).await;
        assert_eq!(f.transport.frames.lock().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_stops_frames_synchronously() {
        let mut f = connected_caller(StreamConfig::default().frame_sample_count * 1000).await;
        tokio::time::sleep(Duration::from_millis(35)).await;

        f.session.end_call().await.unwrap();
        let delivered = f.transport.frames.lock().len();
        assert!(!f.session.is_streaming());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.transport.frames.lock().len(), delivered);
        assert_eq!(f.session.state(), CallState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_failure_fails_session() {
        let mut f = connected_caller(4800).await;
        let result = f
            .session
            .on_scheduler_event(SchedulerEvent::Failed {
                consecutive_failures: 3,
            })
            .await;

        assert_eq!(
            result,
            Err(CallError::DeliveryDropped {
                consecutive_failures: 3
            })
        );
        assert_eq!(f.session.state(), CallState::Failed);
        assert!(!f.session.is_streaming());
        assert!(!f.session.has_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_deadline_only_while_connecting() {
        let mut f = fixture();
        assert!(f.session.connect_deadline().is_none());

        f.session.initiate_call("peer-b").await.unwrap();
        f.session
            .handle_signal(IncomingMessage::CallAccepted {
                signal: SessionDescription::answer("remote-answer"),
            })
            .await
            .unwrap();

        let deadline = f.session.connect_deadline().unwrap();
        assert_eq!(deadline - Instant::now(), SessionConfig::default().connect_timeout);

        let result = f.session.connectivity_timed_out().await;
        assert!(matches!(result, Err(CallError::Negotiation(_))));
        assert_eq!(f.session.state(), CallState::Failed);
        assert!(f.session.connect_deadline().is_none());
    }

    #[tokio::test]
    async fn test_connectivity_failure_is_fatal() {
        let mut f = fixture();
        f.session.initiate_call("peer-b").await.unwrap();
        let result = f
            .session
            .on_transport_event(TransportEvent::ConnectivityFailed("ice failed".to_string()))
            .await;

        assert_eq!(result, Err(CallError::Negotiation("ice failed".to_string())));
        assert_eq!(f.session.state(), CallState::Failed);
    }

    #[test]
    fn test_transition_table() {
        use CallState::*;
        assert!(Idle.can_transition_to(Outgoing));
        assert!(Idle.can_transition_to(IncomingRinging));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Failed));
        assert!(!Outgoing.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        for terminal in [Ended, Failed] {
            for next in [Idle, Outgoing, IncomingRinging, Connecting, Connected, Ended, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }
}
