//! Error types for the relay

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relay error types
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Cloudflare challenge: {0}")]
    CloudflareChallenge(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider protocol error: {0}")]
    ProviderProtocol(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid provider config: {0}")]
    InvalidConfig(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Canonical error classification delivered to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    CloudflareChallenge,
    NetworkError,
    ProviderProtocolError,
    UnknownProvider,
}

impl ErrorKind {
    /// Wire code sent in the `error` field of the duplex channel.
    ///
    /// Authorization and challenge failures use fixed codes so clients can
    /// offer a retry after the user re-authenticates.
    pub fn client_code(&self) -> Option<&'static str> {
        match self {
            Self::Unauthorized => Some("UNAUTHORIZED"),
            Self::CloudflareChallenge => Some("CLOUDFLARE"),
            _ => None,
        }
    }

    /// Whether this failure means the cached credential must be dropped.
    pub fn invalidates_credential(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::CloudflareChallenge)
    }
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::CloudflareChallenge(_) => ErrorKind::CloudflareChallenge,
            Self::Network(_) => ErrorKind::NetworkError,
            Self::Http(err) if err.is_decode() => ErrorKind::ProviderProtocolError,
            Self::Http(_) => ErrorKind::NetworkError,
            Self::ProviderProtocol(_) | Self::Json(_) => ErrorKind::ProviderProtocolError,
            // A known provider with unusable settings is as unresolvable as an unknown one.
            Self::UnknownProvider(_) | Self::InvalidConfig(_) => ErrorKind::UnknownProvider,
        }
    }

    /// The message without the variant prefix.
    pub(crate) fn detail(&self) -> String {
        match self {
            Self::Unauthorized(msg)
            | Self::CloudflareChallenge(msg)
            | Self::Network(msg)
            | Self::ProviderProtocol(msg)
            | Self::UnknownProvider(msg)
            | Self::InvalidConfig(msg) => msg.clone(),
            Self::Http(err) => err.to_string(),
            Self::Json(err) => err.to_string(),
        }
    }

    /// Rebuild an error from its classification, e.g. to hand one failure
    /// to several waiters.
    pub(crate) fn from_kind(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            ErrorKind::Unauthorized => Self::Unauthorized(detail),
            ErrorKind::CloudflareChallenge => Self::CloudflareChallenge(detail),
            ErrorKind::NetworkError => Self::Network(detail),
            ErrorKind::ProviderProtocolError => Self::ProviderProtocol(detail),
            ErrorKind::UnknownProvider => Self::UnknownProvider(detail),
        }
    }
}

/// Truncate a backend body before quoting it in an error message.
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX_ERROR_BODY: usize = 512;
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &body[..end])
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
