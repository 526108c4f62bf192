//! AskFlow AI - streaming answer relay
//!
//! This crate provides:
//! - Adapters for event-stream, signed-socket and direct-call chat backends
//! - HMAC request signing for the signed-socket backend
//! - Normalization of backend output into cumulative canonical events
//! - A provider selector and a single-flight bearer token cache
//! - A session manager that relays one question per duplex channel

pub mod auth;
pub mod error;
pub mod event;
mod http_client;
pub mod normalizer;
pub mod provider;
pub mod selector;
pub mod session;
pub mod signer;

// Re-export commonly used types
pub use auth::{AuthToken, AuthTokenCache, SessionTokenSource, TokenSource};
pub use error::{ErrorKind, RelayError, Result};
pub use event::{CanonicalEvent, ClientMessage, HostRequest, RawEvent, ServerMessage};
pub use http_client::{HttpConfig, build_http_client};
pub use normalizer::{Normalizer, TextMode, normalize};
pub use provider::{
    Adapter, DirectCallAdapter, ProviderConfig, ProviderKind, ProviderSettings, SharedSettings,
    SignedSocketAdapter, SocketConnector, SocketTransport, SseAdapter, SseDialect,
    TungsteniteConnector,
};
pub use selector::ProviderSelector;
pub use session::{SessionConfig, SessionManager, SessionOutcome};
