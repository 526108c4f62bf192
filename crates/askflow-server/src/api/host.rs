use askflow_ai::{AuthToken, HostRequest};
use axum::{Extension, Json};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

/// Opaque host requests that sit outside the streaming protocol.
pub async fn handle_host_request(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<HostRequest>,
) -> Result<Json<Value>, ApiError> {
    match request {
        HostRequest::OpenOptionsPage => Ok(Json(json!({ "url": state.options_url }))),
        HostRequest::GetAccessToken => {
            let token = state.token_cache.get().await?;
            Ok(Json(token_body(&token)))
        }
        HostRequest::RefreshAccessToken => {
            let token = state.token_cache.refresh().await?;
            Ok(Json(token_body(&token)))
        }
    }
}

fn token_body(token: &AuthToken) -> Value {
    json!({
        "accessToken": token.value,
        "acquiredAt": token.acquired_at,
    })
}
