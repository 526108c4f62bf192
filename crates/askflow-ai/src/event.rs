//! Canonical events and the duplex-channel wire format

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, RelayError};

/// What an adapter observed on its backend, before normalization.
#[derive(Debug)]
pub enum RawEvent {
    /// A piece of answer text. Delta or cumulative depending on the backend.
    Text {
        fragment: String,
        message_id: Option<String>,
        conversation_id: Option<String>,
    },
    /// The backend signalled the end of the answer.
    Finished,
    /// The exchange failed; nothing follows.
    Failed(RelayError),
}

impl RawEvent {
    pub fn text(fragment: impl Into<String>) -> Self {
        Self::Text {
            fragment: fragment.into(),
            message_id: None,
            conversation_id: None,
        }
    }
}

/// Normalized event delivered to clients regardless of backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalEvent {
    /// Full answer text generated so far.
    Answer {
        text: String,
        message_id: String,
        conversation_id: String,
    },
    Done,
    Error { kind: ErrorKind, message: String },
}

impl CanonicalEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    pub fn from_error(err: &RelayError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub type RawStream = Pin<Box<dyn Stream<Item = RawEvent> + Send>>;

pub type EventStream = Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>>;

/// Message a client sends to start a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientMessage {
    pub question: String,
}

impl ClientMessage {
    /// Parse one client text frame.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text)
            .map_err(|e| RelayError::ProviderProtocol(format!("malformed client message: {e}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamMarker {
    #[serde(rename = "DONE")]
    Done,
}

/// Message the relay sends back on the duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServerMessage {
    Answer {
        text: String,
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Done {
        event: StreamMarker,
    },
    Error {
        error: String,
        kind: ErrorKind,
    },
}

impl From<CanonicalEvent> for ServerMessage {
    fn from(event: CanonicalEvent) -> Self {
        match event {
            CanonicalEvent::Answer {
                text,
                message_id,
                conversation_id,
            } => Self::Answer {
                text,
                message_id,
                conversation_id,
            },
            CanonicalEvent::Done => Self::Done {
                event: StreamMarker::Done,
            },
            CanonicalEvent::Error { kind, message } => Self::Error {
                error: kind.client_code().map(str::to_string).unwrap_or(message),
                kind,
            },
        }
    }
}

/// Out-of-band requests a client's host makes outside any session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostRequest {
    OpenOptionsPage,
    GetAccessToken,
    RefreshAccessToken,
}
