//! Provider identifiers, externally supplied settings and resolved configs

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RelayError, Result};
use crate::normalizer::TextMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Signed WebSocket backend.
    Spark,
    /// Token-based conversation backend streamed over SSE.
    ChatGpt,
    /// Single request/response chat completion.
    Gpt3,
    /// Streaming chat-completions API over SSE.
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spark => "spark",
            Self::ChatGpt => "chatgpt",
            Self::Gpt3 => "gpt3",
            Self::OpenAi => "openai",
        }
    }

    pub fn parse(id: &str) -> Result<Self> {
        match id.trim().to_lowercase().as_str() {
            "spark" => Ok(Self::Spark),
            "chatgpt" => Ok(Self::ChatGpt),
            "gpt3" => Ok(Self::Gpt3),
            "openai" => Ok(Self::OpenAi),
            _ => Err(RelayError::UnknownProvider(id.to_string())),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider configuration as supplied by the host. Sections for providers
/// other than `selected` are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub selected: String,
    pub spark: SparkSettings,
    pub chatgpt: ChatGptSettings,
    pub openai: OpenAiSettings,
    pub gpt3: DirectCallSettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            selected: ProviderKind::Spark.as_str().to_string(),
            spark: SparkSettings::default(),
            chatgpt: ChatGptSettings::default(),
            openai: OpenAiSettings::default(),
            gpt3: DirectCallSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SparkSettings {
    pub app_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub url: String,
    pub domain: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub uid: String,
}

impl Default for SparkSettings {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            url: "wss://spark-api.xf-yun.com/v3.5/chat".to_string(),
            domain: "generalv3.5".to_string(),
            temperature: 0.5,
            max_tokens: 1024,
            uid: "askflow".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatGptSettings {
    /// Where the bearer credential is acquired from.
    pub session_url: String,
    pub conversation_url: String,
    pub model: String,
    pub text_mode: Option<TextMode>,
}

impl Default for ChatGptSettings {
    fn default() -> Self {
        Self {
            session_url: "https://chat.openai.com/api/auth/session".to_string(),
            conversation_url: "https://chat.openai.com/backend-api/conversation".to_string(),
            model: "text-davinci-002-render".to_string(),
            text_mode: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub text_mode: Option<TextMode>,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            text_mode: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectCallSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl Default for DirectCallSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-3.5-turbo".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignedSocketConfig {
    pub app_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub endpoint: Url,
    pub domain: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub uid: String,
}

#[derive(Debug, Clone)]
pub struct TokenBasedConfig {
    pub conversation_url: Url,
    pub model: String,
    pub text_mode: Option<TextMode>,
}

#[derive(Debug, Clone)]
pub struct DirectCallConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Url,
}

#[derive(Debug, Clone)]
pub struct StreamingApiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Url,
    pub text_mode: Option<TextMode>,
}

/// Configuration resolved for one session. Immutable once built.
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    SignedSocket(SignedSocketConfig),
    TokenBased(TokenBasedConfig),
    DirectCall(DirectCallConfig),
    StreamingApi(StreamingApiConfig),
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::SignedSocket(_) => ProviderKind::Spark,
            Self::TokenBased(_) => ProviderKind::ChatGpt,
            Self::DirectCall(_) => ProviderKind::Gpt3,
            Self::StreamingApi(_) => ProviderKind::OpenAi,
        }
    }
}

impl ProviderSettings {
    /// Validate the selected provider's section. Performs no I/O.
    pub fn resolve_config(&self) -> Result<ProviderConfig> {
        match ProviderKind::parse(&self.selected)? {
            ProviderKind::Spark => {
                let spark = &self.spark;
                Ok(ProviderConfig::SignedSocket(SignedSocketConfig {
                    app_id: required("spark.app_id", &spark.app_id)?,
                    api_key: required("spark.api_key", &spark.api_key)?,
                    api_secret: required("spark.api_secret", &spark.api_secret)?,
                    endpoint: parse_url("spark.url", &spark.url)?,
                    domain: spark.domain.clone(),
                    temperature: spark.temperature,
                    max_tokens: spark.max_tokens,
                    uid: spark.uid.clone(),
                }))
            }
            ProviderKind::ChatGpt => Ok(ProviderConfig::TokenBased(TokenBasedConfig {
                conversation_url: parse_url(
                    "chatgpt.conversation_url",
                    &self.chatgpt.conversation_url,
                )?,
                model: required("chatgpt.model", &self.chatgpt.model)?,
                text_mode: self.chatgpt.text_mode,
            })),
            ProviderKind::Gpt3 => Ok(ProviderConfig::DirectCall(DirectCallConfig {
                api_key: required("gpt3.api_key", &self.gpt3.api_key)?,
                model: required("gpt3.model", &self.gpt3.model)?,
                base_url: parse_url("gpt3.base_url", &self.gpt3.base_url)?,
            })),
            ProviderKind::OpenAi => Ok(ProviderConfig::StreamingApi(StreamingApiConfig {
                api_key: required("openai.api_key", &self.openai.api_key)?,
                model: required("openai.model", &self.openai.model)?,
                base_url: parse_url("openai.base_url", &self.openai.base_url)?,
                text_mode: self.openai.text_mode,
            })),
        }
    }
}

fn required(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RelayError::InvalidConfig(format!("{field} is empty")));
    }
    Ok(value.to_string())
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    Url::parse(value.trim())
        .map_err(|err| RelayError::InvalidConfig(format!("{field} '{value}' is invalid: {err}")))
}

/// Settings handle that can be swapped while sessions are running. Each
/// session works from the snapshot taken when it started.
pub struct SharedSettings {
    inner: RwLock<Arc<ProviderSettings>>,
}

impl SharedSettings {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            inner: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn snapshot(&self) -> Arc<ProviderSettings> {
        self.inner.read().clone()
    }

    /// Replace the settings, returning the previous ones.
    pub fn replace(&self, settings: ProviderSettings) -> Arc<ProviderSettings> {
        let mut guard = self.inner.write();
        std::mem::replace(&mut *guard, Arc::new(settings))
    }

    /// Switch the selected provider after validating the identifier.
    pub fn select(&self, id: &str) -> Result<ProviderKind> {
        let kind = ProviderKind::parse(id)?;
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        next.selected = kind.as_str().to_string();
        *guard = Arc::new(next);
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn spark_settings() -> ProviderSettings {
        ProviderSettings {
            spark: SparkSettings {
                app_id: "app".into(),
                api_key: "key".into(),
                api_secret: "secret".into(),
                ..SparkSettings::default()
            },
            ..ProviderSettings::default()
        }
    }

    #[test]
    fn identifiers_parse_case_insensitively() {
        assert_eq!(ProviderKind::parse("Spark").unwrap(), ProviderKind::Spark);
        assert_eq!(
            " CHATGPT ".parse::<ProviderKind>().unwrap(),
            ProviderKind::ChatGpt
        );
        assert_eq!(ProviderKind::parse("gpt3").unwrap(), ProviderKind::Gpt3);
        assert_eq!(
            ProviderKind::parse("bard").unwrap_err().kind(),
            ErrorKind::UnknownProvider
        );
    }

    #[test]
    fn default_selection_is_signed_socket() {
        let config = spark_settings().resolve_config().unwrap();
        let ProviderConfig::SignedSocket(spark) = config else {
            panic!("expected signed socket config");
        };
        assert_eq!(spark.endpoint.host_str(), Some("spark-api.xf-yun.com"));
        assert_eq!(spark.domain, "generalv3.5");
        assert_eq!(spark.max_tokens, 1024);
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let settings = ProviderSettings {
            selected: "gpt3".into(),
            ..ProviderSettings::default()
        };
        let err = settings.resolve_config().unwrap_err();
        assert!(matches!(err, RelayError::InvalidConfig(_)));
        assert!(err.to_string().contains("gpt3.api_key"));
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: ProviderSettings = serde_json::from_value(serde_json::json!({
            "selected": "openai",
            "openai": { "api_key": "sk-test", "text_mode": "cumulative" }
        }))
        .unwrap();
        let ProviderConfig::StreamingApi(config) = settings.resolve_config().unwrap() else {
            panic!("expected streaming api config");
        };
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.text_mode, Some(TextMode::Cumulative));
    }

    #[test]
    fn shared_settings_swap_selection() {
        let shared = SharedSettings::new(spark_settings());
        let before = shared.snapshot();
        assert_eq!(shared.select("OpenAI").unwrap(), ProviderKind::OpenAi);
        assert_eq!(before.selected, "spark");
        assert_eq!(shared.snapshot().selected, "openai");
        assert!(shared.select("unknown").is_err());
        assert_eq!(shared.snapshot().selected, "openai");
    }
}
