//! Signed WebSocket adapter

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{RelayError, Result};
use crate::event::{RawEvent, RawStream};
use crate::normalizer::{TextMode, classify_socket_code};
use crate::provider::{ProviderKind, SignedSocketConfig};
use crate::signer::signed_url;

const STATUS_COMPLETE: i64 = 2;

/// Opens socket transports. The production connector speaks WebSocket; tests
/// substitute in-memory transports.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn SocketTransport>>;
}

/// A connected, message-framed duplex transport.
#[async_trait]
pub trait SocketTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text frame, `None` once the peer closed.
    async fn next_text(&mut self) -> Option<Result<String>>;

    /// Close the transport. Must return within a bounded time.
    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    close_timeout: Duration,
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(1),
        }
    }
}

impl TungsteniteConnector {
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn SocketTransport>> {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _)) => Ok(Box::new(TungsteniteTransport {
                stream,
                close_timeout: self.close_timeout,
            })),
            Err(tungstenite::Error::Http(response))
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                Err(RelayError::Unauthorized(format!(
                    "socket handshake rejected with HTTP {}",
                    response.status().as_u16()
                )))
            }
            Err(e) => Err(RelayError::Network(format!("socket connect failed: {e}"))),
        }
    }
}

struct TungsteniteTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    close_timeout: Duration,
}

#[async_trait]
impl SocketTransport for TungsteniteTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| RelayError::Network(format!("socket send failed: {e}")))
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(RelayError::Network(format!("socket error: {e}")))),
            }
        }
    }

    async fn close(&mut self) {
        match tokio::time::timeout(self.close_timeout, self.stream.close(None)).await {
            Ok(Ok(())) => debug!("Socket closed"),
            Ok(Err(e)) => debug!(error = %e, "Socket close handshake failed"),
            Err(_) => warn!("Socket close handshake timed out"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SocketFrame {
    header: FrameHeader,
    #[serde(default)]
    payload: Option<FramePayload>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrameHeader {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    sid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FramePayload {
    #[serde(default)]
    choices: FrameChoices,
}

#[derive(Debug, Default, Deserialize)]
struct FrameChoices {
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    seq: Option<i64>,
    #[serde(default)]
    text: Vec<FrameText>,
}

#[derive(Debug, Deserialize)]
struct FrameText {
    #[serde(default)]
    content: String,
}

/// Completion check on a frame that did not parse into `SocketFrame`.
fn value_is_complete(value: &Value) -> bool {
    ["/header/status", "/payload/choices/status"]
        .iter()
        .any(|pointer| value.pointer(pointer).and_then(Value::as_i64) == Some(STATUS_COMPLETE))
}

impl SocketFrame {
    fn is_complete(&self) -> bool {
        self.header.status == Some(STATUS_COMPLETE)
            || self
                .payload
                .as_ref()
                .and_then(|payload| payload.choices.status)
                == Some(STATUS_COMPLETE)
    }

    fn seq(&self) -> Option<i64> {
        self.payload.as_ref().and_then(|payload| payload.choices.seq)
    }

    fn fragment(&self) -> String {
        self.payload
            .as_ref()
            .map(|payload| {
                payload
                    .choices
                    .text
                    .iter()
                    .map(|text| text.content.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Tracks the previous frame so a completion frame that merely echoes it is
/// not appended twice.
#[derive(Debug, Default)]
struct EchoGuard {
    last_seq: Option<i64>,
    last_fragment: Option<String>,
}

impl EchoGuard {
    fn is_repeat(&self, seq: Option<i64>, fragment: &str, complete: bool) -> bool {
        let Some(last_fragment) = &self.last_fragment else {
            return false;
        };
        match (seq, self.last_seq) {
            (Some(seq), Some(last_seq)) => seq == last_seq,
            _ => complete && fragment == last_fragment,
        }
    }

    fn record(&mut self, seq: Option<i64>, fragment: String) {
        self.last_seq = seq;
        self.last_fragment = Some(fragment);
    }
}

#[derive(Clone)]
pub struct SignedSocketAdapter {
    config: SignedSocketConfig,
    connector: Arc<dyn SocketConnector>,
}

impl std::fmt::Debug for SignedSocketAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedSocketAdapter")
            .field("endpoint", &self.config.endpoint.as_str())
            .field("app_id", &self.config.app_id)
            .field("domain", &self.config.domain)
            .finish_non_exhaustive()
    }
}

impl SignedSocketAdapter {
    pub fn new(config: SignedSocketConfig, connector: Arc<dyn SocketConnector>) -> Self {
        Self { config, connector }
    }

    pub fn provider(&self) -> ProviderKind {
        ProviderKind::Spark
    }

    /// Each frame carries only the newest fragment.
    pub fn text_mode(&self) -> TextMode {
        TextMode::Delta
    }

    fn request_frame(&self, question: &str) -> Value {
        json!({
            "header": {
                "app_id": self.config.app_id,
                "uid": self.config.uid,
            },
            "parameter": {
                "chat": {
                    "domain": self.config.domain,
                    "temperature": self.config.temperature,
                    "max_tokens": self.config.max_tokens,
                }
            },
            "payload": {
                "message": {
                    "text": [{ "role": "user", "content": question }]
                }
            }
        })
    }

    pub fn open_raw(&self, question: &str, cancel: CancellationToken) -> RawStream {
        let adapter = self.clone();
        let request = self.request_frame(question).to_string();

        Box::pin(stream! {
            let url = match signed_url(
                &adapter.config.endpoint,
                &adapter.config.api_key,
                &adapter.config.api_secret,
                Utc::now(),
            ) {
                Ok(url) => url,
                Err(err) => {
                    yield RawEvent::Failed(err);
                    return;
                }
            };

            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Socket connect cancelled");
                    return;
                }
                result = adapter.connector.connect(&url) => result,
            };
            let mut transport = match connected {
                Ok(transport) => transport,
                Err(err) => {
                    yield RawEvent::Failed(err);
                    return;
                }
            };

            if let Err(err) = transport.send_text(request).await {
                transport.close().await;
                yield RawEvent::Failed(err);
                return;
            }

            let mut echo = EchoGuard::default();
            // Set while the newest frame was unreadable; a close right after
            // it means the completion frame itself was lost.
            let mut dropped_malformed = false;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Socket session cancelled; closing transport");
                        transport.close().await;
                        return;
                    }
                    next = transport.next_text() => next,
                };

                let text = match next {
                    Some(Ok(text)) => text,
                    Some(Err(err)) => {
                        transport.close().await;
                        yield RawEvent::Failed(err);
                        return;
                    }
                    None if dropped_malformed => {
                        yield RawEvent::Failed(RelayError::ProviderProtocol(
                            "socket closed after an unreadable final frame".to_string(),
                        ));
                        return;
                    }
                    None => {
                        yield RawEvent::Failed(RelayError::Network(
                            "socket closed before the answer completed".to_string(),
                        ));
                        return;
                    }
                };

                let value: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed socket frame");
                        dropped_malformed = true;
                        continue;
                    }
                };
                let frame: SocketFrame = match serde_json::from_value(value.clone()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        if value_is_complete(&value) {
                            transport.close().await;
                            yield RawEvent::Failed(RelayError::ProviderProtocol(format!(
                                "malformed completion frame: {e}"
                            )));
                            return;
                        }
                        warn!(error = %e, "Dropping socket frame with unexpected shape");
                        dropped_malformed = true;
                        continue;
                    }
                };
                dropped_malformed = false;

                if frame.header.code != 0 {
                    transport.close().await;
                    yield RawEvent::Failed(classify_socket_code(frame.header.code, &frame.header.message));
                    return;
                }

                let complete = frame.is_complete();
                let seq = frame.seq();
                let fragment = frame.fragment();
                if echo.is_repeat(seq, &fragment, complete) {
                    debug!(?seq, "Skipping repeated socket fragment");
                } else if !fragment.is_empty() {
                    echo.record(seq, fragment.clone());
                    yield RawEvent::Text {
                        fragment,
                        message_id: frame.id.clone().or_else(|| frame.header.sid.clone()),
                        conversation_id: frame.id.clone().or_else(|| frame.header.sid.clone()),
                    };
                }

                if complete {
                    transport.close().await;
                    yield RawEvent::Finished;
                    return;
                }
            }
        })
    }
}
