use askflow_ai::{
    AuthTokenCache, ProviderSelector, SessionManager, SessionTokenSource, SharedSettings,
    TungsteniteConnector, build_http_client,
};
use std::sync::Arc;
use url::Url;

use crate::config::ServerConfig;

/// Shared by every handler and socket.
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub token_cache: Arc<AuthTokenCache>,
    pub settings: Arc<SharedSettings>,
    pub options_url: String,
}

impl AppState {
    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let client = build_http_client(&config.http)?;
        let session_url = Url::parse(&config.provider.chatgpt.session_url).map_err(|err| {
            anyhow::anyhow!(
                "Invalid chatgpt.session_url {}: {}",
                config.provider.chatgpt.session_url,
                err
            )
        })?;
        let token_cache = Arc::new(AuthTokenCache::new(Arc::new(SessionTokenSource::new(
            client.clone(),
            session_url,
        ))));
        let selector = ProviderSelector::new(
            client,
            token_cache.clone(),
            Arc::new(TungsteniteConnector::default()),
        );
        let settings = Arc::new(SharedSettings::new(config.provider.clone()));
        let sessions = Arc::new(SessionManager::new(
            selector,
            settings.clone(),
            config.session.clone(),
        ));

        Ok(Self {
            sessions,
            token_cache,
            settings,
            options_url: config.options_url.clone(),
        })
    }
}
