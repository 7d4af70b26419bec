//! GET /v1/models: the model cache projected into a list both client
//! dialects can digest (OpenAI container, entries carrying the Anthropic
//! fields too).

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::app::AppState;

pub async fn models_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let config = state.config_snapshot().await;
    if !crate::auth::authorized(&headers, &config) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "type": "error",
                "error": {"type": "authentication_error", "message": "invalid gateway key"}
            })),
        )
            .into_response();
    }

    state.refresh_models(&config).await;
    let created = chrono::Utc::now().timestamp();
    let data: Vec<serde_json::Value> = state
        .models
        .all()
        .await
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "type": "model",
                "display_name": m.id,
                "created": created,
                "owned_by": "kiro",
            })
        })
        .collect();

    (StatusCode::OK, Json(json!({"object": "list", "data": data}))).into_response()
}
