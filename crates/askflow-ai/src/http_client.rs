use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::error::Result;

const DISABLE_SYSTEM_PROXY_ENV: &str = "ASKFLOW_DISABLE_SYSTEM_PROXY";

/// Timeouts for the shared backend HTTP client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_ms: u64,
    /// Applies to the whole exchange, including a streamed body, so keep it generous.
    pub request_timeout_ms: Option<u64>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: None,
        }
    }
}

pub fn build_http_client(config: &HttpConfig) -> Result<Client> {
    let mut builder =
        Client::builder().connect_timeout(Duration::from_millis(config.connect_timeout_ms));
    if let Some(timeout_ms) = config.request_timeout_ms {
        builder = builder.timeout(Duration::from_millis(timeout_ms));
    }
    if should_disable_system_proxy() {
        builder = builder.no_proxy();
    }
    Ok(builder.build()?)
}

fn should_disable_system_proxy() -> bool {
    if std::env::var_os(DISABLE_SYSTEM_PROXY_ENV).is_some() {
        return true;
    }

    cfg!(test)
}
