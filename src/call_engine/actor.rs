//! Session Actor
//!
//! Besitzt eine `CallSession` in einem eigenen Task und serialisiert
//! Benutzer-Intents, Relay-Nachrichten, Transport- und Scheduler-Events
//! sowie den Verbindungs-Timeout. `SessionHandle` ist die klonbare
//! Fernbedienung dafür.

use super::session::{CallError, CallEvent, CallSession, CallState, SessionReceivers};
use crate::signaling::IncomingMessage;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

type Reply = oneshot::Sender<Result<(), CallError>>;

enum SessionCommand {
    Call { peer_id: String, reply: Reply },
    Accept { reply: Reply },
    Reject { reply: Reply },
    End { reply: Reply },
    Signal { message: IncomingMessage, reply: Reply },
}

impl SessionCommand {
    fn operation(&self) -> &'static str {
        match self {
            SessionCommand::Call { .. } => "initiate_call",
            SessionCommand::Accept { .. } => "accept_call",
            SessionCommand::Reject { .. } => "reject_call",
            SessionCommand::End { .. } => "end_call",
            SessionCommand::Signal { message, .. } => message.kind(),
        }
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Klonbarer Zugriff auf eine laufende Session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<CallState>,
    events: broadcast::Sender<CallEvent>,
}

impl SessionHandle {
    /// Aktueller Zustand
    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub async fn initiate_call(&self, peer_id: impl Into<String>) -> Result<(), CallError> {
        let peer_id = peer_id.into();
        self.request(|reply| SessionCommand::Call { peer_id, reply })
            .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| SessionCommand::Accept { reply }).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| SessionCommand::Reject { reply }).await
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| SessionCommand::End { reply }).await
    }

    /// Leitet eine Relay-Nachricht an die Session weiter
    pub async fn handle_signal(&self, message: IncomingMessage) -> Result<(), CallError> {
        self.request(|reply| SessionCommand::Signal { message, reply })
            .await
    }

    /// Wartet bis `Connected`. Endet die Session vorher, ist das ein
    /// Verhandlungsfehler.
    pub async fn await_connectivity_established(&self) -> Result<(), CallError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s == CallState::Connected || s.is_terminal())
            .await
            .map(|s| *s);

        match reached {
            Ok(CallState::Connected) => Ok(()),
            Ok(other) => Err(CallError::Negotiation(format!(
                "session reached {:?} before connectivity was established",
                other
            ))),
            Err(_) => Err(CallError::Negotiation(
                "session closed before connectivity was established".to_string(),
            )),
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(Reply) -> SessionCommand,
    ) -> Result<(), CallError> {
        let (reply, response) = oneshot::channel();
        let command = build(reply);
        let operation = command.operation();

        if self.commands.send(command).is_err() {
            return Err(self.closed(operation));
        }
        response.await.unwrap_or_else(|_| Err(self.closed(operation)))
    }

    /// Der Actor ist weg, die Session also terminal
    fn closed(&self, operation: &'static str) -> CallError {
        CallError::InvalidState {
            operation,
            state: self.state(),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// ACTOR
// ============================================================================

/// Startet den Actor-Task für eine Session
pub fn spawn_session(session: CallSession, receivers: SessionReceivers) -> SessionHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        commands: commands_tx,
        state: session.watch_state(),
        events: session.event_sender(),
    };

    tokio::spawn(run(session, receivers, commands_rx));
    handle
}

async fn run(
    mut session: CallSession,
    mut receivers: SessionReceivers,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) {
    loop {
        let deadline = session.connect_deadline();

        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => dispatch(&mut session, command).await,
                None => {
                    // Alle Handles weg: Anruf nicht verwaist lassen
                    if !session.state().is_terminal() {
                        let _ = session.end_call().await;
                    }
                }
            },
            Some(event) = receivers.transport.recv() => {
                if let Err(e) = session.on_transport_event(event).await {
                    tracing::warn!("Transport event failed: {}", e);
                }
            }
            Some(event) = receivers.scheduler.recv() => {
                if let Err(e) = session.on_scheduler_event(event).await {
                    tracing::warn!("Scheduler event failed: {}", e);
                }
            }
            _ = sleep_until(deadline) => {
                if let Err(e) = session.connectivity_timed_out().await {
                    tracing::warn!("Connect timeout: {}", e);
                }
            }
        }

        if session.state().is_terminal() {
            break;
        }
    }

    tracing::debug!("Session actor for {:?} finished", session.peer_id());
}

async fn dispatch(session: &mut CallSession, command: SessionCommand) {
    let (result, reply) = match command {
        SessionCommand::Call { peer_id, reply } => (session.initiate_call(&peer_id).await, reply),
        SessionCommand::Accept { reply } => (session.accept_call().await, reply),
        SessionCommand::Reject { reply } => (session.reject_call().await, reply),
        SessionCommand::End { reply } => (session.end_call().await, reply),
        SessionCommand::Signal { message, reply } => (session.handle_signal(message).await, reply),
    };
    let _ = reply.send(result);
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
