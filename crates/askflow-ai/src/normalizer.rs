//! Maps adapter output onto the canonical event model.
//!
//! Clients re-render the whole answer on every update, so each `Answer`
//! carries the full text so far. Backends that stream deltas are accumulated
//! here; backends that already stream the full text pass through.

use async_stream::stream;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, truncate_body};
use crate::event::{CanonicalEvent, EventStream, RawEvent, RawStream};

/// End-of-turn markers some backends interleave with answer text.
const CONTROL_FRAGMENTS: &[&str] = &["<|im_end|>", "<|im_sep|>"];

const CLOUDFLARE_MARKERS: &[&str] = &[
    "cf-chl",
    "cf_chl_opt",
    "challenge-platform",
    "Just a moment...",
];

/// Whether a backend sends increments or the full text so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMode {
    #[default]
    Delta,
    Cumulative,
}

/// Per-session accumulator.
#[derive(Debug)]
pub struct Normalizer {
    mode: TextMode,
    text: String,
    message_id: String,
    conversation_id: String,
}

impl Normalizer {
    pub fn new(mode: TextMode) -> Self {
        Self {
            mode,
            text: String::new(),
            message_id: String::new(),
            conversation_id: String::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Translate one raw event. `None` means nothing should reach the client.
    pub fn apply(&mut self, event: RawEvent) -> Option<CanonicalEvent> {
        match event {
            RawEvent::Text {
                fragment,
                message_id,
                conversation_id,
            } => {
                if let Some(id) = message_id {
                    self.message_id = id;
                }
                if let Some(id) = conversation_id {
                    self.conversation_id = id;
                }
                if is_control_fragment(&fragment) || fragment.is_empty() {
                    return None;
                }

                match self.mode {
                    TextMode::Delta => self.text.push_str(&fragment),
                    TextMode::Cumulative => {
                        if fragment.len() < self.text.len() {
                            tracing::debug!(
                                current = self.text.len(),
                                incoming = fragment.len(),
                                "Dropping cumulative text shorter than current answer"
                            );
                            return None;
                        }
                        if fragment == self.text {
                            return None;
                        }
                        self.text = fragment;
                    }
                }

                Some(CanonicalEvent::Answer {
                    text: self.text.clone(),
                    message_id: self.message_id.clone(),
                    conversation_id: self.conversation_id.clone(),
                })
            }
            RawEvent::Finished => Some(CanonicalEvent::Done),
            RawEvent::Failed(err) => Some(CanonicalEvent::from_error(&err)),
        }
    }
}

pub fn is_control_fragment(fragment: &str) -> bool {
    CONTROL_FRAGMENTS.contains(&fragment.trim())
}

/// Wrap an adapter's raw stream. The result ends right after its first
/// terminal event; a raw stream that ends without one yields a network error.
pub fn normalize(mut raw: RawStream, mode: TextMode) -> EventStream {
    Box::pin(stream! {
        let mut normalizer = Normalizer::new(mode);
        let mut terminated = false;

        while let Some(event) = raw.next().await {
            let Some(event) = normalizer.apply(event) else {
                continue;
            };
            terminated = event.is_terminal();
            yield event;
            if terminated {
                break;
            }
        }

        if !terminated {
            yield CanonicalEvent::from_error(&RelayError::Network(
                "backend stream ended before completion".to_string(),
            ));
        }
    })
}

pub fn is_cloudflare_challenge(headers: &HeaderMap, body: &str) -> bool {
    let mitigated = headers
        .get("cf-mitigated")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("challenge"));
    mitigated || CLOUDFLARE_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Classify a failed HTTP exchange from its status, headers and body.
pub fn classify_http_failure(
    provider: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> RelayError {
    if status == StatusCode::UNAUTHORIZED {
        return RelayError::Unauthorized(format!("{provider} returned HTTP 401"));
    }
    if is_cloudflare_challenge(headers, body) {
        return RelayError::CloudflareChallenge(format!(
            "{provider} answered HTTP {} with a challenge page",
            status.as_u16()
        ));
    }
    if status == StatusCode::FORBIDDEN {
        return RelayError::Unauthorized(format!("{provider} returned HTTP 403"));
    }

    let message = format!(
        "{provider} returned HTTP {}: {}",
        status.as_u16(),
        truncate_body(body)
    );
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            RelayError::Network(message)
        }
        _ => RelayError::ProviderProtocol(message),
    }
}

/// Consume a non-success response and classify it.
pub async fn classify_response(response: Response, provider: &str) -> RelayError {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    classify_http_failure(provider, status, &headers, &body)
}

/// Classify a non-zero status code from the signed-socket backend.
pub fn classify_socket_code(code: i64, message: &str) -> RelayError {
    let detail = format!("{code}: {message}");
    match code {
        // App id mismatch and authorization/licence failures.
        10313 | 11200..=11203 => RelayError::Unauthorized(detail),
        _ => RelayError::ProviderProtocol(detail),
    }
}
