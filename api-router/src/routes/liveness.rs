use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Process liveness probe.
pub async fn live() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "live" })))
}
