//! Server-Sent-Events adapter

use async_stream::stream;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::event::{RawEvent, RawStream};
use crate::normalizer::{TextMode, classify_response, is_cloudflare_challenge};
use crate::provider::ProviderKind;

const DONE_SENTINEL: &str = "[DONE]";

/// JSON layout of the events a backend streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseDialect {
    /// `choices[0].delta.content` increments, `finish_reason` marks the end.
    ChatCompletions,
    /// `message.content.parts[0]` holds the full text so far.
    ConversationWeb,
}

impl SseDialect {
    pub fn default_text_mode(&self) -> TextMode {
        match self {
            Self::ChatCompletions => TextMode::Delta,
            Self::ConversationWeb => TextMode::Cumulative,
        }
    }

    fn request_body(&self, model: &str, question: &str) -> Value {
        match self {
            Self::ChatCompletions => json!({
                "model": model,
                "messages": [{ "role": "user", "content": question }],
                "stream": true,
            }),
            Self::ConversationWeb => json!({
                "action": "next",
                "messages": [{
                    "id": Uuid::new_v4().to_string(),
                    "author": { "role": "user" },
                    "content": { "content_type": "text", "parts": [question] },
                }],
                "model": model,
                "parent_message_id": Uuid::new_v4().to_string(),
            }),
        }
    }

    fn extract(&self, payload: &Value) -> SseFrame {
        let error = payload
            .get("error")
            .filter(|err| !err.is_null())
            .map(|err| {
                err.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string())
            });

        match self {
            Self::ChatCompletions => {
                let choice = payload.pointer("/choices/0");
                let id = str_at(payload, "/id");
                SseFrame {
                    fragment: choice.and_then(|choice| {
                        str_at(choice, "/delta/content").or_else(|| str_at(choice, "/text"))
                    }),
                    message_id: id.clone(),
                    conversation_id: id,
                    finished: choice
                        .and_then(|choice| choice.get("finish_reason"))
                        .is_some_and(|reason| !reason.is_null()),
                    error,
                }
            }
            Self::ConversationWeb => {
                let from_assistant = payload
                    .pointer("/message/author/role")
                    .and_then(Value::as_str)
                    .is_none_or(|role| role == "assistant");
                SseFrame {
                    fragment: from_assistant
                        .then(|| str_at(payload, "/message/content/parts/0"))
                        .flatten(),
                    message_id: str_at(payload, "/message/id"),
                    conversation_id: str_at(payload, "/conversation_id"),
                    finished: str_at(payload, "/message/status").as_deref()
                        == Some("finished_successfully")
                        || payload.pointer("/message/end_turn") == Some(&Value::Bool(true)),
                    error,
                }
            }
        }
    }
}

fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[derive(Debug, Default, PartialEq)]
struct SseFrame {
    fragment: Option<String>,
    message_id: Option<String>,
    conversation_id: Option<String>,
    finished: bool,
    error: Option<String>,
}

/// What one complete event-stream event means for the session.
#[derive(Debug)]
enum SseStep {
    Emit(RawEvent),
    Done,
    Fail(RelayError),
    Skip,
}

/// Streams one answer from an event-stream backend.
#[derive(Debug, Clone)]
pub struct SseAdapter {
    client: Client,
    provider: ProviderKind,
    url: String,
    bearer: String,
    model: String,
    dialect: SseDialect,
    text_mode: TextMode,
}

impl SseAdapter {
    pub fn new(
        client: Client,
        provider: ProviderKind,
        url: impl Into<String>,
        bearer: impl Into<String>,
        model: impl Into<String>,
        dialect: SseDialect,
    ) -> Self {
        Self {
            client,
            provider,
            url: url.into(),
            bearer: bearer.into(),
            model: model.into(),
            dialect,
            text_mode: dialect.default_text_mode(),
        }
    }

    /// Override the dialect's text convention for backends that differ.
    pub fn with_text_mode(mut self, mode: TextMode) -> Self {
        self.text_mode = mode;
        self
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn text_mode(&self) -> TextMode {
        self.text_mode
    }

    pub fn open_raw(&self, question: &str, cancel: CancellationToken) -> RawStream {
        let adapter = self.clone();
        let body = self.dialect.request_body(&self.model, question);

        Box::pin(stream! {
            let provider = adapter.provider.as_str();
            let request = adapter
                .client
                .post(&adapter.url)
                .bearer_auth(&adapter.bearer)
                .header(ACCEPT, "text/event-stream")
                .json(&body)
                .send();

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(provider, "SSE request cancelled before response");
                    return;
                }
                result = request => result,
            };
            let response = match response {
                Ok(resp) => resp,
                Err(e) => {
                    yield RawEvent::Failed(RelayError::Network(format!("{provider} request failed: {e}")));
                    return;
                }
            };

            if !response.status().is_success() {
                let err = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(provider, "SSE error body read cancelled");
                        return;
                    }
                    err = classify_response(response, provider) => err,
                };
                yield RawEvent::Failed(err);
                return;
            }

            let is_html = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.starts_with("text/html"));
            if is_html {
                let headers = response.headers().clone();
                let body = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(provider, "SSE HTML body read cancelled");
                        return;
                    }
                    body = response.text() => body.unwrap_or_default(),
                };
                let err = if is_cloudflare_challenge(&headers, &body) {
                    RelayError::CloudflareChallenge(format!("{provider} served a challenge page"))
                } else {
                    RelayError::ProviderProtocol(format!("{provider} served HTML instead of an event stream"))
                };
                yield RawEvent::Failed(err);
                return;
            }

            let mut byte_stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut end_marker_seen = false;

            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(provider, "SSE stream cancelled; dropping response body");
                        return;
                    }
                    chunk = byte_stream.next() => chunk,
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        buffer.extend(bytes.iter().copied().filter(|byte| *byte != b'\r'));
                    }
                    Some(Err(e)) => {
                        yield RawEvent::Failed(RelayError::Network(format!("{provider} stream error: {e}")));
                        return;
                    }
                    None => break,
                }

                // Process complete SSE events from buffer
                while let Some(event) = take_event(&mut buffer) {
                    match interpret(adapter.dialect, &event, &mut end_marker_seen) {
                        SseStep::Emit(raw) => yield raw,
                        SseStep::Done => {
                            yield RawEvent::Finished;
                            return;
                        }
                        SseStep::Fail(err) => {
                            yield RawEvent::Failed(err);
                            return;
                        }
                        SseStep::Skip => {}
                    }
                }
            }

            // The last event may lack its trailing blank line.
            let remaining = String::from_utf8_lossy(&buffer).into_owned();
            if !remaining.trim().is_empty() {
                match interpret(adapter.dialect, &remaining, &mut end_marker_seen) {
                    SseStep::Emit(raw) => yield raw,
                    SseStep::Done => {
                        yield RawEvent::Finished;
                        return;
                    }
                    SseStep::Fail(err) => {
                        yield RawEvent::Failed(err);
                        return;
                    }
                    SseStep::Skip => {}
                }
            }

            if end_marker_seen {
                yield RawEvent::Finished;
            } else {
                yield RawEvent::Failed(RelayError::Network(format!(
                    "{provider} closed the stream before {DONE_SENTINEL}"
                )));
            }
        })
    }
}

/// Split the first complete event off `buffer`.
fn take_event(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.windows(2).position(|window| window == b"\n\n")?;
    let event: Vec<u8> = buffer.drain(..pos + 2).collect();
    Some(String::from_utf8_lossy(&event[..pos]).into_owned())
}

/// Join the `data:` lines of one event. Comments and other fields are ignored.
fn event_data(event: &str) -> Option<String> {
    let lines: Vec<&str> = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn interpret(dialect: SseDialect, event: &str, end_marker_seen: &mut bool) -> SseStep {
    let Some(data) = event_data(event) else {
        return SseStep::Skip;
    };
    let data = data.trim();
    if data == DONE_SENTINEL {
        return SseStep::Done;
    }
    if data.is_empty() {
        return SseStep::Skip;
    }

    let payload: Value = match serde_json::from_str(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Dropping malformed SSE event");
            return SseStep::Skip;
        }
    };

    let frame = dialect.extract(&payload);
    if let Some(message) = frame.error {
        return SseStep::Fail(RelayError::ProviderProtocol(message));
    }
    if frame.finished {
        *end_marker_seen = true;
    }

    match frame.fragment {
        Some(fragment) => SseStep::Emit(RawEvent::Text {
            fragment,
            message_id: frame.message_id,
            conversation_id: frame.conversation_id,
        }),
        None => SseStep::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_events_on_blank_lines() {
        let mut buffer = b"data: a\n\ndata: b\n\ndata: c".to_vec();
        assert_eq!(take_event(&mut buffer).as_deref(), Some("data: a"));
        assert_eq!(take_event(&mut buffer).as_deref(), Some("data: b"));
        assert_eq!(take_event(&mut buffer), None);
        assert_eq!(buffer, b"data: c");
    }

    #[test]
    fn joins_multiline_data_and_skips_comments() {
        assert_eq!(
            event_data(": keep-alive\nevent: delta\ndata: {\"a\":\ndata:1}").as_deref(),
            Some("{\"a\":\n1}")
        );
        assert_eq!(event_data(": ping"), None);
    }

    #[test]
    fn chat_completions_dialect_extracts_delta() {
        let frame = SseDialect::ChatCompletions.extract(&json!({
            "id": "chatcmpl-1",
            "choices": [{ "delta": { "content": "Hi" }, "finish_reason": null }]
        }));
        assert_eq!(frame.fragment.as_deref(), Some("Hi"));
        assert_eq!(frame.message_id.as_deref(), Some("chatcmpl-1"));
        assert!(!frame.finished);

        let frame = SseDialect::ChatCompletions.extract(&json!({
            "choices": [{ "delta": {}, "finish_reason": "stop" }]
        }));
        assert_eq!(frame.fragment, None);
        assert!(frame.finished);
    }

    #[test]
    fn chat_completions_dialect_reads_legacy_text() {
        let frame = SseDialect::ChatCompletions.extract(&json!({
            "choices": [{ "text": "legacy", "finish_reason": null }]
        }));
        assert_eq!(frame.fragment.as_deref(), Some("legacy"));
    }

    #[test]
    fn conversation_dialect_extracts_cumulative_parts() {
        let frame = SseDialect::ConversationWeb.extract(&json!({
            "message": {
                "id": "msg-1",
                "author": { "role": "assistant" },
                "content": { "content_type": "text", "parts": ["Hello wor"] },
                "status": "in_progress"
            },
            "conversation_id": "conv-1",
            "error": null
        }));
        assert_eq!(frame.fragment.as_deref(), Some("Hello wor"));
        assert_eq!(frame.message_id.as_deref(), Some("msg-1"));
        assert_eq!(frame.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(frame.error, None);
        assert!(!frame.finished);

        let frame = SseDialect::ConversationWeb.extract(&json!({
            "message": {
                "author": { "role": "assistant" },
                "content": { "parts": ["Hello world"] },
                "status": "finished_successfully"
            }
        }));
        assert!(frame.finished);
    }

    #[test]
    fn conversation_dialect_ignores_user_echo() {
        let frame = SseDialect::ConversationWeb.extract(&json!({
            "message": { "author": { "role": "user" }, "content": { "parts": ["question"] } }
        }));
        assert_eq!(frame.fragment, None);
    }

    #[test]
    fn interpret_handles_sentinel_and_garbage() {
        let mut seen = false;
        assert!(matches!(
            interpret(SseDialect::ChatCompletions, "data: [DONE]", &mut seen),
            SseStep::Done
        ));
        assert!(matches!(
            interpret(SseDialect::ChatCompletions, "data: {not json", &mut seen),
            SseStep::Skip
        ));
        assert!(matches!(
            interpret(
                SseDialect::ChatCompletions,
                "data: {\"error\":{\"message\":\"overloaded\"}}",
                &mut seen
            ),
            SseStep::Fail(RelayError::ProviderProtocol(_))
        ));
        assert!(!seen);
    }
}
