use askflow_ai::{HttpConfig, ProviderSettings, SessionConfig};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Where hosts are sent when they ask to open the settings surface.
    pub options_url: String,
    pub log_json: bool,
    pub session: SessionConfig,
    pub http: HttpConfig,
    pub provider: ProviderSettings,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    http: HttpConfig,
    #[serde(default)]
    provider: ProviderSettings,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_options_url")]
    options_url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            options_url: default_options_url(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LoggingSection {
    #[serde(default)]
    json: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_options_url() -> String {
    "/api/provider".to_string()
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        if let Some((path, contents)) = read_config_file()? {
            return Self::from_toml_str(&contents)
                .map_err(|err| anyhow::anyhow!("Failed to parse config {}: {}", path, err));
        }

        Ok(Self::from_env())
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let file: FileConfig = toml::from_str(contents)?;
        Ok(Self {
            host: file.server.host,
            port: file.server.port,
            options_url: file.server.options_url,
            log_json: file.logging.json,
            session: file.session,
            http: file.http,
            provider: file.provider,
        })
    }

    fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut provider = ProviderSettings::default();
        if let Some(selected) = var("ASKFLOW_PROVIDER") {
            provider.selected = selected;
        }
        if let Some(value) = var("ASKFLOW_SPARK_APP_ID") {
            provider.spark.app_id = value;
        }
        if let Some(value) = var("ASKFLOW_SPARK_API_KEY") {
            provider.spark.api_key = value;
        }
        if let Some(value) = var("ASKFLOW_SPARK_API_SECRET") {
            provider.spark.api_secret = value;
        }
        if let Some(value) = var("ASKFLOW_OPENAI_API_KEY") {
            provider.openai.api_key = value.clone();
            provider.gpt3.api_key = value;
        }
        if let Some(value) = var("ASKFLOW_OPENAI_MODEL") {
            provider.openai.model = value;
        }

        Self {
            host: var("ASKFLOW_HOST").unwrap_or_else(default_host),
            port: var("ASKFLOW_PORT")
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or_else(default_port),
            options_url: default_options_url(),
            log_json: var("ASKFLOW_LOG_JSON")
                .is_some_and(|value| matches!(value.as_str(), "1" | "true")),
            session: SessionConfig::default(),
            http: HttpConfig::default(),
            provider,
        }
    }
}

fn read_config_file() -> anyhow::Result<Option<(String, String)>> {
    let path = if let Ok(path) = env::var("ASKFLOW_SERVER_CONFIG") {
        path
    } else if Path::new("askflow.toml").exists() {
        "askflow.toml".to_string()
    } else {
        return Ok(None);
    };

    let contents = fs::read_to_string(&path)
        .map_err(|err| anyhow::anyhow!("Failed to read config {}: {}", path, err))?;
    Ok(Some((path, contents)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn toml_sections_map_onto_config() {
        let config = ServerConfig::from_toml_str(
            r#"
            [server]
            port = 9000

            [session]
            close_timeout_ms = 250

            [logging]
            json = true

            [provider]
            selected = "openai"

            [provider.openai]
            api_key = "sk-file"
            text_mode = "cumulative"
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert!(config.log_json);
        assert_eq!(config.session.close_timeout_ms, 250);
        assert_eq!(config.provider.selected, "openai");
        assert_eq!(config.provider.openai.api_key, "sk-file");
        assert_eq!(config.provider.openai.model, "gpt-4o-mini");
        assert_eq!(config.provider.spark.domain, "generalv3.5");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config.port, 8787);
        assert_eq!(config.options_url, "/api/provider");
        assert_eq!(config.provider.selected, "spark");
        assert_eq!(config.session.close_timeout_ms, 2_000);
    }

    #[test]
    fn environment_overrides_credentials() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ASKFLOW_PORT", "7000"),
            ("ASKFLOW_PROVIDER", "gpt3"),
            ("ASKFLOW_OPENAI_API_KEY", "sk-env"),
            ("ASKFLOW_SPARK_APP_ID", "app-env"),
            ("ASKFLOW_LOG_JSON", "true"),
        ]);
        let config = ServerConfig::from_vars(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.port, 7000);
        assert!(config.log_json);
        assert_eq!(config.provider.selected, "gpt3");
        assert_eq!(config.provider.gpt3.api_key, "sk-env");
        assert_eq!(config.provider.openai.api_key, "sk-env");
        assert_eq!(config.provider.spark.app_id, "app-env");
    }
}
