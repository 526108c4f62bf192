pub mod host;
pub mod provider;

use axum::{
    Router,
    routing::{get, post},
};

/// Build the side-channel API router
pub fn router() -> Router {
    Router::new()
        .route("/host", post(host::handle_host_request))
        .route(
            "/provider",
            get(provider::get_provider).put(provider::select_provider),
        )
}
