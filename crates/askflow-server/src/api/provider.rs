use askflow_ai::ProviderKind;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

const KNOWN_PROVIDERS: [ProviderKind; 4] = [
    ProviderKind::Spark,
    ProviderKind::ChatGpt,
    ProviderKind::Gpt3,
    ProviderKind::OpenAi,
];

#[derive(Debug, Serialize)]
pub struct ProviderView {
    pub selected: String,
    pub available: Vec<ProviderKind>,
}

#[derive(Debug, Deserialize)]
pub struct SelectProvider {
    pub selected: String,
}

pub async fn get_provider(Extension(state): Extension<Arc<AppState>>) -> Json<ProviderView> {
    Json(ProviderView {
        selected: state.settings.snapshot().selected.clone(),
        available: KNOWN_PROVIDERS.to_vec(),
    })
}

/// Switch the provider used by sessions started from now on.
pub async fn select_provider(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<SelectProvider>,
) -> Result<Json<ProviderView>, ApiError> {
    let kind = state.settings.select(&request.selected)?;
    tracing::info!(provider = %kind, "Selected provider changed");
    Ok(Json(ProviderView {
        selected: kind.as_str().to_string(),
        available: KNOWN_PROVIDERS.to_vec(),
    }))
}
