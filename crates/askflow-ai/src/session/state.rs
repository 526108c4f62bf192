use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::event::CanonicalEvent;
use crate::provider::ProviderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Streaming,
    Terminated,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Failed(ErrorKind),
    /// The client went away, or the relay shut down, before a terminal event.
    Abandoned,
}

/// One relay of a single question. Owned by the session manager.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    provider: Option<ProviderKind>,
    cancel: CancellationToken,
    answer: String,
    state: SessionState,
    terminal_sent: bool,
    outcome: Option<SessionOutcome>,
}

impl Session {
    pub fn new(id: Uuid, cancel: CancellationToken) -> Self {
        Self {
            id,
            provider: None,
            cancel,
            answer: String::new(),
            state: SessionState::Idle,
            terminal_sent: false,
            outcome: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn provider(&self) -> Option<ProviderKind> {
        self.provider
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn begin(&mut self, provider: ProviderKind) {
        if self.state == SessionState::Idle {
            self.provider = Some(provider);
            self.state = SessionState::Streaming;
        }
    }

    /// Gate an event on its way to the client. Returns `None` when it must not
    /// be forwarded: anything after the terminal event, or an answer shorter
    /// than one already sent.
    pub fn deliver(&mut self, event: CanonicalEvent) -> Option<CanonicalEvent> {
        if self.terminal_sent || self.state == SessionState::Terminated {
            debug!(session_id = %self.id, "Dropping event after termination");
            return None;
        }

        match &event {
            CanonicalEvent::Answer { text, .. } => {
                if text.len() < self.answer.len() {
                    debug!(session_id = %self.id, "Dropping regressive answer update");
                    return None;
                }
                self.answer.clone_from(text);
            }
            CanonicalEvent::Done => self.terminate(SessionOutcome::Completed),
            CanonicalEvent::Error { kind, .. } => self.terminate(SessionOutcome::Failed(*kind)),
        }
        Some(event)
    }

    /// The client is gone; nothing more is forwarded.
    pub fn abandon(&mut self) {
        if self.state != SessionState::Terminated {
            self.state = SessionState::Terminated;
            self.outcome = Some(SessionOutcome::Abandoned);
        }
        self.cancel.cancel();
    }

    /// Signal the adapter to close its transport. Idempotent.
    pub fn release(&self) {
        self.cancel.cancel();
    }

    pub fn outcome(&self) -> SessionOutcome {
        self.outcome.unwrap_or(SessionOutcome::Abandoned)
    }

    fn terminate(&mut self, outcome: SessionOutcome) {
        self.terminal_sent = true;
        self.state = SessionState::Terminated;
        self.outcome = Some(outcome);
        self.cancel.cancel();
    }
}
