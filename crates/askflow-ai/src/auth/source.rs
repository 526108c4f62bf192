use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use super::TokenSource;
use crate::error::{RelayError, Result, truncate_body};
use crate::normalizer::is_cloudflare_challenge;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_token: Option<String>,
}

/// Reads the access token from the web session endpoint.
#[derive(Debug, Clone)]
pub struct SessionTokenSource {
    client: Client,
    session_url: Url,
}

impl SessionTokenSource {
    pub fn new(client: Client, session_url: Url) -> Self {
        Self {
            client,
            session_url,
        }
    }

    pub fn session_url(&self) -> &Url {
        &self.session_url
    }
}

#[async_trait]
impl TokenSource for SessionTokenSource {
    async fn acquire(&self) -> Result<String> {
        let response = self
            .client
            .get(self.session_url.clone())
            .send()
            .await
            .map_err(|e| RelayError::Network(format!("session request failed: {e}")))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Network(format!("session body read failed: {e}")))?;

        if status == StatusCode::FORBIDDEN || is_cloudflare_challenge(&headers, &body) {
            return Err(RelayError::CloudflareChallenge(format!(
                "session endpoint answered HTTP {} with a challenge",
                status.as_u16()
            )));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(RelayError::Unauthorized(
                "session endpoint returned HTTP 401".into(),
            ));
        }
        if !status.is_success() {
            return Err(RelayError::Network(format!(
                "session endpoint returned HTTP {}: {}",
                status.as_u16(),
                truncate_body(&body)
            )));
        }

        let session: SessionResponse = serde_json::from_str(&body).map_err(|e| {
            RelayError::ProviderProtocol(format!("malformed session response: {e}"))
        })?;
        session
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RelayError::Unauthorized("session has no access token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn source_for(server: &MockServer) -> SessionTokenSource {
        let url = Url::parse(&format!("{}/api/auth/session", server.uri())).unwrap();
        SessionTokenSource::new(Client::new(), url)
    }

    async fn mount(server: &MockServer, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path("/api/auth/session"))
            .respond_with(response)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn reads_access_token() {
        let server = MockServer::start().await;
        mount(
            &server,
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "accessToken": "tok-abc", "user": {} })),
        )
        .await;

        let token = source_for(&server).await.acquire().await.unwrap();
        assert_eq!(token, "tok-abc");
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let server = MockServer::start().await;
        mount(&server, ResponseTemplate::new(200).set_body_json(serde_json::json!({}))).await;

        let err = source_for(&server).await.acquire().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn forbidden_is_a_challenge() {
        let server = MockServer::start().await;
        mount(
            &server,
            ResponseTemplate::new(403)
                .set_body_raw("<html><title>Just a moment...</title></html>", "text/html"),
        )
        .await;

        let err = source_for(&server).await.acquire().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CloudflareChallenge);
    }

    #[tokio::test]
    async fn unauthorized_status_is_unauthorized() {
        let server = MockServer::start().await;
        mount(&server, ResponseTemplate::new(401)).await;

        let err = source_for(&server).await.acquire().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }
}
