//! Direct-call adapter: one request, one complete answer

use async_stream::stream;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RelayError;
use crate::event::{RawEvent, RawStream};
use crate::normalizer::{TextMode, classify_response};
use crate::provider::ProviderKind;

#[derive(Deserialize)]
struct DirectResponse {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<DirectChoice>,
}

#[derive(Deserialize)]
struct DirectChoice {
    message: DirectMessage,
}

#[derive(Deserialize)]
struct DirectMessage {
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DirectCallAdapter {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl DirectCallAdapter {
    pub fn new(
        client: Client,
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        ProviderKind::Gpt3
    }

    /// The single answer is already complete.
    pub fn text_mode(&self) -> TextMode {
        TextMode::Cumulative
    }

    pub fn open_raw(&self, question: &str, cancel: CancellationToken) -> RawStream {
        let adapter = self.clone();
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": question }],
        });

        Box::pin(stream! {
            let provider = adapter.provider().as_str();
            let url = format!("{}/chat/completions", adapter.base_url.trim_end_matches('/'));
            let exchange = async {
                let response = adapter
                    .client
                    .post(&url)
                    .bearer_auth(&adapter.api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| RelayError::Network(format!("{provider} request failed: {e}")))?;
                if !response.status().is_success() {
                    return Err(classify_response(response, provider).await);
                }
                let text = response
                    .text()
                    .await
                    .map_err(|e| RelayError::Network(format!("{provider} body read failed: {e}")))?;
                parse_answer(&text)
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(provider, "Direct call cancelled; aborting request");
                    return;
                }
                result = exchange => result,
            };

            match result {
                Ok((answer, id)) => {
                    yield RawEvent::Text {
                        fragment: answer,
                        message_id: id.clone(),
                        conversation_id: id,
                    };
                    yield RawEvent::Finished;
                }
                Err(err) => yield RawEvent::Failed(err),
            }
        })
    }
}

/// The response is the terminal message, so a malformed one is fatal.
fn parse_answer(body: &str) -> Result<(String, Option<String>), RelayError> {
    let response: DirectResponse = serde_json::from_str(body)
        .map_err(|e| RelayError::ProviderProtocol(format!("malformed completion response: {e}")))?;
    let answer = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.is_empty())
        .ok_or_else(|| RelayError::ProviderProtocol("completion response had no answer".into()))?;
    Ok((answer, response.id))
}
