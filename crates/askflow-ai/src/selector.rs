//! Turns externally supplied settings into a ready adapter

use std::sync::Arc;

use reqwest::Client;
use tracing::debug;

use crate::auth::AuthTokenCache;
use crate::error::Result;
use crate::provider::{
    Adapter, DirectCallAdapter, ProviderConfig, ProviderKind, ProviderSettings,
    SignedSocketAdapter, SocketConnector, SseAdapter, SseDialect,
};

pub struct ProviderSelector {
    client: Client,
    token_cache: Arc<AuthTokenCache>,
    connector: Arc<dyn SocketConnector>,
}

impl ProviderSelector {
    pub fn new(
        client: Client,
        token_cache: Arc<AuthTokenCache>,
        connector: Arc<dyn SocketConnector>,
    ) -> Self {
        Self {
            client,
            token_cache,
            connector,
        }
    }

    pub fn token_cache(&self) -> &Arc<AuthTokenCache> {
        &self.token_cache
    }

    /// Resolve the selected provider. Identifier and settings are validated
    /// before any I/O; only the token-based family performs a round trip here.
    pub async fn resolve(&self, settings: &ProviderSettings) -> Result<Adapter> {
        let config = settings.resolve_config()?;
        self.adapter_for(config).await
    }

    pub async fn adapter_for(&self, config: ProviderConfig) -> Result<Adapter> {
        debug!(provider = %config.kind(), "Resolving provider adapter");
        let adapter = match config {
            ProviderConfig::SignedSocket(config) => {
                Adapter::SignedSocket(SignedSocketAdapter::new(config, self.connector.clone()))
            }
            ProviderConfig::TokenBased(config) => {
                let token = self.token_cache.get().await?;
                let adapter = SseAdapter::new(
                    self.client.clone(),
                    ProviderKind::ChatGpt,
                    config.conversation_url.as_str(),
                    token.value,
                    config.model,
                    SseDialect::ConversationWeb,
                );
                Adapter::Sse(match config.text_mode {
                    Some(mode) => adapter.with_text_mode(mode),
                    None => adapter,
                })
            }
            ProviderConfig::StreamingApi(config) => {
                let url = format!(
                    "{}/chat/completions",
                    config.base_url.as_str().trim_end_matches('/')
                );
                let adapter = SseAdapter::new(
                    self.client.clone(),
                    ProviderKind::OpenAi,
                    url,
                    config.api_key,
                    config.model,
                    SseDialect::ChatCompletions,
                );
                Adapter::Sse(match config.text_mode {
                    Some(mode) => adapter.with_text_mode(mode),
                    None => adapter,
                })
            }
            ProviderConfig::DirectCall(config) => Adapter::DirectCall(DirectCallAdapter::new(
                self.client.clone(),
                config.api_key,
                config.model,
                config.base_url.as_str(),
            )),
        };
        Ok(adapter)
    }
}

impl std::fmt::Debug for ProviderSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSelector")
            .field("token_cache", &self.token_cache)
            .finish_non_exhaustive()
    }
}
