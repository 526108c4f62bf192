//! Provider module - backend adapters behind one capability

mod config;
mod direct;
mod socket;
mod sse;

pub use config::{
    ChatGptSettings, DirectCallConfig, DirectCallSettings, OpenAiSettings, ProviderConfig,
    ProviderKind, ProviderSettings, SharedSettings, SignedSocketConfig, SparkSettings,
    StreamingApiConfig, TokenBasedConfig,
};
pub use direct::DirectCallAdapter;
pub use socket::{SignedSocketAdapter, SocketConnector, SocketTransport, TungsteniteConnector};
pub use sse::{SseAdapter, SseDialect};

use tokio_util::sync::CancellationToken;

use crate::event::{EventStream, RawStream};
use crate::normalizer::{TextMode, normalize};

/// A backend adapter chosen at runtime by the selector.
#[derive(Debug, Clone)]
pub enum Adapter {
    Sse(SseAdapter),
    SignedSocket(SignedSocketAdapter),
    DirectCall(DirectCallAdapter),
}

impl Adapter {
    pub fn provider(&self) -> ProviderKind {
        match self {
            Self::Sse(adapter) => adapter.provider(),
            Self::SignedSocket(adapter) => adapter.provider(),
            Self::DirectCall(adapter) => adapter.provider(),
        }
    }

    pub fn text_mode(&self) -> TextMode {
        match self {
            Self::Sse(adapter) => adapter.text_mode(),
            Self::SignedSocket(adapter) => adapter.text_mode(),
            Self::DirectCall(adapter) => adapter.text_mode(),
        }
    }

    /// Backend messages as observed on the wire. Nothing happens until the
    /// stream is polled; cancelling `cancel` closes the transport.
    pub fn open_raw(&self, question: &str, cancel: CancellationToken) -> RawStream {
        match self {
            Self::Sse(adapter) => adapter.open_raw(question, cancel),
            Self::SignedSocket(adapter) => adapter.open_raw(question, cancel),
            Self::DirectCall(adapter) => adapter.open_raw(question, cancel),
        }
    }

    /// Canonical events for one answer, ending with exactly one terminal event
    /// unless cancelled first.
    pub fn open(&self, question: &str, cancel: CancellationToken) -> EventStream {
        normalize(self.open_raw(question, cancel), self.text_mode())
    }
}
