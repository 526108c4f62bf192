use askflow_ai::{ErrorKind, RelayError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// JSON error body shaped `{error: {code, message, kind}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub kind: ErrorKind,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.status.as_u16(),
                "message": self.message,
                "kind": self.kind,
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let kind = err.kind();
        let status = match kind {
            ErrorKind::Unauthorized | ErrorKind::CloudflareChallenge => StatusCode::UNAUTHORIZED,
            ErrorKind::NetworkError | ErrorKind::ProviderProtocolError => StatusCode::BAD_GATEWAY,
            ErrorKind::UnknownProvider => StatusCode::BAD_REQUEST,
        };
        tracing::warn!(error = %err, "Relay error");
        Self {
            status,
            message: kind
                .client_code()
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
            kind,
        }
    }
}
