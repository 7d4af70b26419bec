//! GET /healthz: liveness probe. 200 while the credential manager still has
//! a usable credential, 503 once the refresh token has been rejected.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::app::AppState;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let healthy = state.credentials.healthy();
    let provider = state.credentials.provider().await;
    let stats = state.truncation.stats();

    let body = json!({
        "status": if healthy { "ok" } else { "credential_failed" },
        "auth": {
            "provider": provider,
            "healthy": healthy,
        },
        "truncation_cache": stats,
    });

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}
