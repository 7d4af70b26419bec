use axum::{
    routing::{get, post},
    Router,
};
use kiro_auth::CredentialManager;
use kiro_core::config::GatewayConfig;
use kiro_translate::TruncationCache;
use kiro_upstream::{KiroClient, ModelInfoCache};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
/// Every service is constructed once in the composition root; nothing here
/// is a process-wide singleton.
pub struct AppState {
    /// Config is read per operation, never captured at startup, so tests can
    /// swap values without re-building the router.
    pub config: RwLock<GatewayConfig>,
    pub credentials: Arc<CredentialManager>,
    pub kiro: KiroClient,
    pub models: ModelInfoCache,
    pub truncation: Arc<TruncationCache>,
    /// Plain client for gateway-side fetches (image URLs).
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: GatewayConfig, credentials: Arc<CredentialManager>) -> Self {
        Self {
            config: RwLock::new(config),
            credentials,
            kiro: KiroClient::new(),
            models: ModelInfoCache::default(),
            truncation: Arc::new(TruncationCache::default()),
            http: reqwest::Client::new(),
        }
    }

    pub async fn config_snapshot(&self) -> GatewayConfig {
        self.config.read().await.clone()
    }

    /// Refresh the model cache opportunistically. Failures are fine; the
    /// built-in table keeps serving.
    pub async fn refresh_models(&self, config: &GatewayConfig) {
        if self.models.is_fresh().await {
            return;
        }
        let Ok(auth_header) = self.credentials.auth_header(config).await else {
            return;
        };

        // OIDC credentials carry no profile ARN, but the listing endpoint
        // still wants one; ask the upstream which profiles exist.
        let mut profile_arn = self.credentials.effective_profile_arn(config).await;
        if profile_arn.is_none() {
            profile_arn = self
                .kiro
                .list_available_profiles(config, &auth_header)
                .await
                .ok()
                .and_then(|profiles| profiles.into_iter().next())
                .map(|profile| profile.arn);
        }

        self.models
            .ensure_fresh(&self.kiro, config, &auth_header, profile_arn.as_deref())
            .await;
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(crate::http::messages::messages_handler))
        .route(
            "/v1/chat/completions",
            post(crate::http::chat_completions::chat_completions_handler),
        )
        .route("/v1/models", get(crate::http::models::models_handler))
        .route("/healthz", get(crate::http::health::health_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
