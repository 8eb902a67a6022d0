//! Health and usage endpoints.

use crate::Deps;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub async fn usage(State(deps): State<Deps>) -> impl IntoResponse {
    match deps.store.usage_summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(error) => {
            tracing::error!(%error, "failed to aggregate usage");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": error.to_string()})),
            )
                .into_response()
        }
    }
}
