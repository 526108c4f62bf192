use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{Session, SessionOutcome};
use crate::error::{RelayError, Result};
use crate::event::{CanonicalEvent, ClientMessage, EventStream, ServerMessage};
use crate::provider::{ProviderKind, SharedSettings};
use crate::selector::ProviderSelector;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on waiting for a cancelled adapter to close its transport.
    pub close_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            close_timeout_ms: 2_000,
        }
    }
}

impl SessionConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Registry entry for a live session.
#[derive(Debug)]
struct SessionInfo {
    provider: Option<ProviderKind>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Drives sessions from question to terminal event.
///
/// Sessions share nothing but the settings snapshot source and the token
/// cache inside the selector. The registry exists only so shutdown can cancel
/// whatever is still running.
pub struct SessionManager {
    selector: ProviderSelector,
    settings: Arc<SharedSettings>,
    config: SessionConfig,
    sessions: DashMap<Uuid, SessionInfo>,
}

impl SessionManager {
    pub fn new(
        selector: ProviderSelector,
        settings: Arc<SharedSettings>,
        config: SessionConfig,
    ) -> Self {
        Self {
            selector,
            settings,
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn selector(&self) -> &ProviderSelector {
        &self.selector
    }

    pub fn settings(&self) -> &Arc<SharedSettings> {
        &self.settings
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel every live session. Each one closes its backend transport and
    /// ends as abandoned.
    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            let info = entry.value();
            debug!(
                session_id = %entry.key(),
                provider = info.provider.map(|p| p.as_str()).unwrap_or("none"),
                age_ms = (Utc::now() - info.started_at).num_milliseconds(),
                "Cancelling session"
            );
            info.cancel.cancel();
        }
        info!(count = self.sessions.len(), "Cancelled all sessions");
    }

    /// Serve one session over a duplex channel.
    ///
    /// The first inbound message is the question; an unreadable one fails the
    /// session. The inbound stream ending means the client closed the channel;
    /// from then on nothing is forwarded and the backend transport is closed
    /// before this returns.
    pub async fn serve<I, O>(&self, mut inbound: I, mut outbound: O) -> SessionOutcome
    where
        I: Stream<Item = Result<ClientMessage>> + Unpin + Send,
        O: Sink<ServerMessage> + Unpin + Send,
        O::Error: Display,
    {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.sessions.insert(
            id,
            SessionInfo {
                provider: None,
                started_at: Utc::now(),
                cancel: cancel.clone(),
            },
        );
        let _registration = scopeguard::guard(id, |id| {
            self.sessions.remove(&id);
        });

        let mut session = Session::new(id, cancel.clone());
        debug!(session_id = %id, "Session opened");

        let question = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            message = inbound.next() => message,
        };
        let question = match question {
            None => {
                session.abandon();
                return self.finish(&session, &mut outbound, None).await;
            }
            Some(Err(err)) => {
                warn!(session_id = %id, error = %err, "Rejecting unreadable question");
                return self.fail(&mut session, &mut outbound, &err).await;
            }
            Some(Ok(question)) => question,
        };

        let settings = self.settings.snapshot();
        let resolve = self.selector.resolve(&settings);
        tokio::pin!(resolve);
        let resolved = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                message = inbound.next() => match message {
                    Some(_) => debug!(session_id = %id, "Ignoring message while resolving"),
                    None => break None,
                },
                result = &mut resolve => break Some(result),
            }
        };

        let adapter = match resolved {
            None => {
                session.abandon();
                return self.finish(&session, &mut outbound, None).await;
            }
            Some(Err(err)) => {
                warn!(session_id = %id, error = %err, "Provider resolution failed");
                if err.kind().invalidates_credential() {
                    self.selector.token_cache().invalidate();
                }
                return self.fail(&mut session, &mut outbound, &err).await;
            }
            Some(Ok(adapter)) => adapter,
        };

        let provider = adapter.provider();
        session.begin(provider);
        if let Some(mut info) = self.sessions.get_mut(&id) {
            info.provider = Some(provider);
        }
        info!(session_id = %id, %provider, "Session streaming");

        let mut events = adapter.open(&question.question, cancel.clone());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    session.abandon();
                    break;
                }
                message = inbound.next() => match message {
                    Some(_) => debug!(session_id = %id, "Ignoring extra client message"),
                    None => {
                        debug!(session_id = %id, "Client closed the channel");
                        session.abandon();
                        break;
                    }
                },
                event = events.next() => {
                    let Some(event) = event else {
                        break;
                    };
                    if let CanonicalEvent::Error { kind, .. } = &event
                        && kind.invalidates_credential()
                        && provider == ProviderKind::ChatGpt
                    {
                        self.selector.token_cache().invalidate();
                    }
                    let Some(event) = session.deliver(event) else {
                        continue;
                    };
                    let terminal = event.is_terminal();
                    if let Err(err) = outbound.send(ServerMessage::from(event)).await {
                        debug!(session_id = %id, error = %err, "Client send failed");
                        session.abandon();
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
            }
        }

        self.finish(&session, &mut outbound, Some(events)).await
    }

    /// End a session that never reached a backend with one error event.
    async fn fail<O>(
        &self,
        session: &mut Session,
        outbound: &mut O,
        err: &RelayError,
    ) -> SessionOutcome
    where
        O: Sink<ServerMessage> + Unpin + Send,
        O::Error: Display,
    {
        if let Some(event) = session.deliver(CanonicalEvent::from_error(err))
            && let Err(send_err) = outbound.send(ServerMessage::from(event)).await
        {
            debug!(session_id = %session.id(), error = %send_err, "Client gone before error delivery");
        }
        self.finish(session, outbound, None).await
    }

    /// Release the adapter and close the channel.
    async fn finish<O>(
        &self,
        session: &Session,
        outbound: &mut O,
        events: Option<EventStream>,
    ) -> SessionOutcome
    where
        O: Sink<ServerMessage> + Unpin + Send,
        O::Error: Display,
    {
        session.release();
        if let Some(mut events) = events {
            // Cancelled adapters close their transport and then end.
            let drain = async { while events.next().await.is_some() {} };
            if tokio::time::timeout(self.config.close_timeout(), drain)
                .await
                .is_err()
            {
                warn!(
                    session_id = %session.id(),
                    timeout_ms = self.config.close_timeout_ms,
                    "Adapter did not release its transport in time"
                );
            }
        }

        if let Err(err) = outbound.close().await {
            debug!(session_id = %session.id(), error = %err, "Closing client channel failed");
        }

        let outcome = session.outcome();
        info!(
            session_id = %session.id(),
            provider = session.provider().map(|p| p.as_str()).unwrap_or("none"),
            outcome = ?outcome,
            "Session ended"
        );
        outcome
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("active_sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
