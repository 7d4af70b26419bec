//! OpenAI-compatible POST /v1/chat/completions.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use kiro_core::GatewayError;
use kiro_translate::openai::{ChatCompletionsRequest, OpenAiErrorResponse};
use kiro_translate::{request as translate, response_openai};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppState;

pub async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionsRequest>,
) -> Response {
    let config = state.config_snapshot().await;
    if !crate::auth::authorized(&headers, &config) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(OpenAiErrorResponse::new("authentication_error", "invalid gateway key")),
        )
            .into_response();
    }

    let correlation_id = Uuid::new_v4();
    info!(%correlation_id, model = %req.model, stream = req.stream, "openai chat request");

    state.refresh_models(&config).await;

    let profile_arn = state.credentials.effective_profile_arn(&config).await;
    let deps = translate::TranslateDeps {
        config: &config,
        models: &state.models,
        truncation: &state.truncation,
        http: &state.http,
        profile_arn,
    };
    let translated = match translate::translate_openai(&req, &deps).await {
        Ok(translated) => translated,
        Err(e) => {
            warn!(%correlation_id, error = %e, "request translation failed");
            return render_error(&e);
        }
    };

    let params = response_openai::ResponseParams {
        model: req.model.clone(),
        family: translated.family,
        reasoning: config.fake_reasoning_handling,
        input_tokens: translated.input_tokens,
    };
    let (mut rx, handle) = super::dispatch(&state, &config, translated);

    if req.stream {
        let Some(first) = rx.recv().await else {
            let e = super::silent_failure(handle).await;
            warn!(%correlation_id, error = %e, "request failed before streaming");
            return render_error(&e);
        };
        let rx = super::rechain(first, rx);
        let stream = response_openai::sse_stream(rx, params, Arc::clone(&state.truncation));
        Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
    } else {
        let collected = response_openai::collect_response(rx, params, &state.truncation).await;
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%correlation_id, error = %e, "request failed");
                return render_error(&e);
            }
            Err(join) => {
                let e = GatewayError::UpstreamTransient(format!("request task failed: {join}"));
                warn!(%correlation_id, error = %e, "request task panicked");
                return render_error(&e);
            }
        }
        match collected {
            Ok(body) => (StatusCode::OK, Json(body)).into_response(),
            Err(e) => {
                warn!(%correlation_id, error = %e, "stream aggregation failed");
                render_error(&e)
            }
        }
    }
}

fn render_error(e: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(OpenAiErrorResponse::new(e.openai_type(), e.to_string()))).into_response()
}
