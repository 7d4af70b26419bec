//! Credential manager: owns the current access token and serializes
//! refreshes.
//!
//! Single-flight: the first caller to find the token expired starts one
//! refresh; everyone racing it awaits the same shared future and observes the
//! same outcome. The refresh runs on a detached task, so a caller that gives
//! up (client disconnect) never aborts a refresh another request will need.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use kiro_core::config::{GatewayConfig, TOKEN_EXPIRY_SKEW_SECS};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::adapter::RefreshAdapter;
use crate::credential::{AuthError, AuthProvider, RefreshCredential};
use crate::store::CredentialStore;

type SharedRefresh = Shared<BoxFuture<'static, Result<String, AuthError>>>;

struct AuthState {
    credential: RefreshCredential,
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl AuthState {
    fn valid_token(&self) -> Option<String> {
        let expires_at = self.expires_at?;
        if Utc::now() + Duration::seconds(TOKEN_EXPIRY_SKEW_SECS) < expires_at {
            self.access_token.clone()
        } else {
            None
        }
    }
}

pub struct CredentialManager {
    state: RwLock<AuthState>,
    in_flight: Mutex<Option<SharedRefresh>>,
    /// Latched on invalid-grant; only a restart with new credentials clears it.
    failed: AtomicBool,
    store: Box<dyn CredentialStore>,
    adapter: RefreshAdapter,
}

impl CredentialManager {
    pub fn new(
        credential: RefreshCredential,
        store: Box<dyn CredentialStore>,
        adapter: RefreshAdapter,
    ) -> Self {
        let state = AuthState {
            access_token: credential.access_token.clone(),
            expires_at: credential.expires_at,
            credential,
        };
        Self {
            state: RwLock::new(state),
            in_flight: Mutex::new(None),
            failed: AtomicBool::new(false),
            store,
            adapter,
        }
    }

    /// `Authorization` header value, refreshing first if the cached token is
    /// missing or inside the expiry skew window.
    pub async fn auth_header(self: &Arc<Self>, config: &GatewayConfig) -> Result<String, AuthError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(AuthError::PermanentlyFailed);
        }

        // Fast path: read lock only.
        if let Some(token) = self.state.read().await.valid_token() {
            return Ok(format!("Bearer {token}"));
        }

        let token = self.join_refresh(config).await?;
        Ok(format!("Bearer {token}"))
    }

    /// Drop the cached token so the next `auth_header` refreshes. Used when
    /// the upstream answers 401/403 for a token we thought was valid.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        state.expires_at = None;
        info!("access token invalidated");
    }

    /// False once the identity provider has rejected the refresh token.
    pub fn healthy(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
    }

    pub async fn provider(&self) -> AuthProvider {
        self.state.read().await.credential.provider()
    }

    /// Profile ARN for upstream envelopes (Desktop only; see credential.rs).
    pub async fn effective_profile_arn(&self, config: &GatewayConfig) -> Option<String> {
        self.state
            .read()
            .await
            .credential
            .effective_profile_arn(config.profile_arn.as_deref())
    }

    /// Await the in-flight refresh, starting one if nobody has.
    async fn join_refresh(self: &Arc<Self>, config: &GatewayConfig) -> Result<String, AuthError> {
        let shared = {
            let mut slot = self.in_flight.lock().await;

            // A refresh may have completed while we waited for the slot.
            if let Some(token) = self.state.read().await.valid_token() {
                return Ok(token);
            }

            match slot.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let manager = Arc::clone(self);
                    let config = config.clone();
                    let fut: SharedRefresh =
                        async move { manager.do_refresh(config).await }.boxed().shared();
                    // Detached driver: the refresh runs to completion even if
                    // every caller is cancelled mid-await.
                    tokio::spawn(shared_to_unit(fut.clone()));
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        shared.await
    }

    async fn do_refresh(self: Arc<Self>, config: GatewayConfig) -> Result<String, AuthError> {
        let credential = self.state.read().await.credential.clone();
        let outcome = self.adapter.refresh(&credential, &config).await;

        let result = match outcome {
            Ok(grant) => {
                let persisted = {
                    let mut state = self.state.write().await;
                    if let Some(rotated) = grant.rotated_refresh_token {
                        state.credential.refresh_token = rotated;
                    }
                    state.credential.access_token = Some(grant.access_token.clone());
                    state.credential.expires_at = Some(grant.expires_at);
                    state.access_token = Some(grant.access_token.clone());
                    state.expires_at = Some(grant.expires_at);
                    state.credential.clone()
                };

                if let Err(e) = self.store.save(&persisted) {
                    warn!(error = %e, "failed to persist refreshed credential");
                }
                Ok(grant.access_token)
            }
            Err(e) => {
                if matches!(e, AuthError::InvalidGrant(_)) {
                    warn!(error = %e, "refresh token rejected; credential marked failed");
                    self.failed.store(true, Ordering::Release);
                }
                Err(e)
            }
        };

        // This attempt is over; the next expiry starts a fresh one. Cleared
        // only after the state update so racing callers see the new token.
        *self.in_flight.lock().await = None;
        result
    }
}

async fn shared_to_unit(fut: SharedRefresh) {
    let _ = fut.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialSource;
    use crate::store::EnvStore;
    use axum::{routing::post, Json, Router};
    use std::sync::atomic::AtomicUsize;

    fn credential() -> RefreshCredential {
        RefreshCredential {
            source: CredentialSource::Env,
            refresh_token: "rt_abc".into(),
            client_id: None,
            client_secret: None,
            sso_region: None,
            profile_arn: None,
            scopes: None,
            access_token: None,
            expires_at: None,
        }
    }

    /// Mock desktop refresh endpoint that counts how many requests land.
    async fn spawn_refresh_endpoint(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/refreshToken",
            post(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({"accessToken": "at_1", "expiresIn": 3600}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/refreshToken")
    }

    fn manager() -> Arc<CredentialManager> {
        Arc::new(CredentialManager::new(
            credential(),
            Box::new(EnvStore::new(Some("rt_abc".into()), None)),
            RefreshAdapter::new(reqwest::Client::new()),
        ))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut config = GatewayConfig::default();
        config.kiro_desktop_token_url = spawn_refresh_endpoint(Arc::clone(&hits)).await;

        let manager = manager();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let manager = Arc::clone(&manager);
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                manager.auth_header(&config).await.unwrap()
            }));
        }

        let mut headers = Vec::new();
        for handle in handles {
            headers.push(handle.await.unwrap());
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one outbound refresh");
        assert!(headers.iter().all(|h| h == "Bearer at_1"));
    }

    #[tokio::test]
    async fn invalidate_forces_a_new_refresh() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut config = GatewayConfig::default();
        config.kiro_desktop_token_url = spawn_refresh_endpoint(Arc::clone(&hits)).await;

        let manager = manager();
        manager.auth_header(&config).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // cached token is reused
        manager.auth_header(&config).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        manager.invalidate().await;
        manager.auth_header(&config).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn caller_cancellation_does_not_abort_the_refresh() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_endpoint = Arc::clone(&hits);
        // slow endpoint: first caller times out before it answers
        let app = Router::new().route(
            "/refreshToken",
            post(move || {
                let hits = Arc::clone(&hits_for_endpoint);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    Json(serde_json::json!({"accessToken": "at_slow", "expiresIn": 3600}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut config = GatewayConfig::default();
        config.kiro_desktop_token_url = format!("http://{addr}/refreshToken");

        let manager = manager();
        let racer = Arc::clone(&manager);
        let racer_config = config.clone();
        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            async move { racer.auth_header(&racer_config).await },
        )
        .await;
        assert!(cancelled.is_err(), "first caller should give up early");

        // the detached refresh finishes and the next caller reuses it
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let header = manager.auth_header(&config).await.unwrap();
        assert_eq!(header, "Bearer at_slow");
        assert_eq!(hits.load(Ordering::SeqCst), 1, "no second refresh was needed");
    }

    #[tokio::test]
    async fn invalid_grant_latches_permanent_failure() {
        let app = Router::new().route(
            "/refreshToken",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "invalid_grant"})),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut config = GatewayConfig::default();
        config.kiro_desktop_token_url = format!("http://{addr}/refreshToken");

        let manager = manager();
        let err = manager.auth_header(&config).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant(_)));
        assert!(!manager.healthy());

        // subsequent calls fail fast without touching the network
        let err = manager.auth_header(&config).await.unwrap_err();
        assert!(matches!(err, AuthError::PermanentlyFailed));
    }
}
