use axum::{
    Extension, Json, Router,
    http::{Method, header},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{api, state::AppState, ws};

#[derive(Serialize)]
struct Health {
    status: &'static str,
    active_sessions: usize,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .nest("/api", api::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        active_sessions: state.sessions.active_sessions(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use askflow_ai::{
        AuthTokenCache, HttpConfig, ProviderSelector, ProviderSettings, RelayError,
        SessionConfig, SessionManager, SharedSettings, TokenSource, TungsteniteConnector,
        build_http_client,
    };
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    struct StaticSource(Option<&'static str>);

    #[async_trait::async_trait]
    impl TokenSource for StaticSource {
        async fn acquire(&self) -> askflow_ai::Result<String> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| RelayError::Unauthorized("signed out".into()))
        }
    }

    fn app(source: StaticSource, settings: ProviderSettings) -> (Router, Arc<AppState>) {
        crate::disable_system_proxy_for_tests();
        let client = build_http_client(&HttpConfig::default()).unwrap();
        let token_cache = Arc::new(AuthTokenCache::new(Arc::new(source)));
        let selector = ProviderSelector::new(
            client,
            token_cache.clone(),
            Arc::new(TungsteniteConnector::default()),
        );
        let settings = Arc::new(SharedSettings::new(settings));
        let state = Arc::new(AppState {
            sessions: Arc::new(SessionManager::new(
                selector,
                settings.clone(),
                SessionConfig::default(),
            )),
            token_cache,
            settings,
            options_url: "/api/provider".into(),
        });
        (build_router(state.clone()), state)
    }

    async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_reports_active_sessions() {
        let (app, _) = app(StaticSource(None), ProviderSettings::default());
        let (status, body) = send(app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "active_sessions": 0 }));
    }

    #[tokio::test]
    async fn provider_selection_is_validated() {
        let (app, state) = app(StaticSource(None), ProviderSettings::default());

        let (status, body) = send(
            app.clone(),
            Method::PUT,
            "/api/provider",
            Some(json!({ "selected": "bard" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "unknown_provider");
        assert_eq!(state.settings.snapshot().selected, "spark");

        let (status, body) = send(
            app.clone(),
            Method::PUT,
            "/api/provider",
            Some(json!({ "selected": "OpenAI" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["selected"], "openai");

        let (_, body) = send(app, Method::GET, "/api/provider", None).await;
        assert_eq!(body["selected"], "openai");
        assert_eq!(body["available"], json!(["spark", "chatgpt", "gpt3", "openai"]));
    }

    #[tokio::test]
    async fn host_requests_reach_token_cache() {
        let (app, state) = app(StaticSource(Some("tok-1")), ProviderSettings::default());

        let (status, body) = send(
            app.clone(),
            Method::POST,
            "/api/host",
            Some(json!({ "type": "GET_ACCESS_TOKEN" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accessToken"], "tok-1");
        assert!(state.token_cache.peek().is_some());

        let (status, body) = send(
            app.clone(),
            Method::POST,
            "/api/host",
            Some(json!({ "type": "REFRESH_ACCESS_TOKEN" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accessToken"], "tok-1");

        let (status, body) = send(
            app,
            Method::POST,
            "/api/host",
            Some(json!({ "type": "OPEN_OPTIONS_PAGE" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["url"], "/api/provider");
    }

    #[tokio::test]
    async fn token_failure_surfaces_client_code() {
        let (app, _) = app(StaticSource(None), ProviderSettings::default());
        let (status, body) = send(
            app,
            Method::POST,
            "/api/host",
            Some(json!({ "type": "GET_ACCESS_TOKEN" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["message"], "UNAUTHORIZED");
        assert_eq!(body["error"]["kind"], "unauthorized");
    }
}
