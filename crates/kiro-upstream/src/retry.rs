//! Retry coordinator: wraps one logical client request.
//!
//! Recovery rules, in order: one 401 (or 403 with an expired-credential
//! body) invalidates the token and retries; 5xx and network failures back
//! off with full jitter; a too-large input gets one summarization pass; a
//! first-token timeout retries because nothing reached the client yet. Any
//! error after the first token is final.

use std::sync::Arc;
use std::time::Duration;

use kiro_core::config::GatewayConfig;
use kiro_core::GatewayError;
use kiro_auth::CredentialManager;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::client::KiroClient;
use crate::envelope::ConversationEnvelope;
use crate::event::SemanticEvent;
use crate::parser::{self, StreamOptions};

const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_CAP_MS: u64 = 4_000;

pub struct RetryContext<'a> {
    pub manager: &'a Arc<CredentialManager>,
    pub client: &'a KiroClient,
    pub config: &'a GatewayConfig,
}

/// Run the request until events flow or an error is final. `shrink_history`
/// is invoked at most once, when the upstream rejects the input as too
/// large; it must make the envelope smaller or fail with `ContextOverflow`.
pub async fn run_with_retries<F>(
    ctx: RetryContext<'_>,
    envelope: &mut ConversationEnvelope,
    tx: &mpsc::Sender<SemanticEvent>,
    mut shrink_history: F,
) -> Result<(), GatewayError>
where
    F: FnMut(&mut ConversationEnvelope) -> Result<(), GatewayError>,
{
    let max_attempts = ctx.config.max_retries.max(1);
    let mut attempt: u32 = 0;
    let mut refreshed_on_auth = false;
    let mut summarized = false;

    loop {
        attempt += 1;
        let auth_header = ctx.manager.auth_header(ctx.config).await?;
        envelope.regenerate_continuation_id();

        // The watchdog starts at dispatch: a connect that hangs past the
        // first-token deadline counts the same as a silent stream.
        let deadline =
            Instant::now() + Duration::from_secs(ctx.config.first_token_timeout.max(1));

        let dispatched = tokio::time::timeout_at(
            deadline,
            ctx.client
                .generate_assistant_response(ctx.config, &auth_header, envelope),
        )
        .await;

        let resp = match dispatched {
            Err(_) => {
                if attempt < max_attempts {
                    info!(attempt, "first-token deadline hit before response; retrying");
                    continue;
                }
                return Err(GatewayError::FirstTokenTimeout {
                    timeout_secs: ctx.config.first_token_timeout,
                });
            }
            Ok(Err(e)) => {
                if attempt < max_attempts {
                    warn!(attempt, error = %e, "upstream dispatch failed; backing off");
                    backoff(attempt).await;
                    continue;
                }
                return Err(e);
            }
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status().as_u16();

        if (status == 401 || status == 403) && !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            let credential_expired = status == 401 || body_indicates_expired(&body);
            if credential_expired && !refreshed_on_auth {
                refreshed_on_auth = true;
                info!(status, "upstream rejected token; refreshing and retrying once");
                ctx.manager.invalidate().await;
                continue;
            }
            // 403 that is not about expiry (e.g. a rejected profileArn) is
            // final; silently dropping the ARN would change semantics.
            return Err(GatewayError::UpstreamFatal { status, message: body });
        }

        if status >= 500 {
            let body = resp.text().await.unwrap_or_default();
            if attempt < max_attempts {
                warn!(status, attempt, "upstream 5xx; backing off");
                backoff(attempt).await;
                continue;
            }
            return Err(GatewayError::UpstreamTransient(format!(
                "upstream {status}: {body}"
            )));
        }

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            if is_input_too_large(status, &body) {
                if !summarized {
                    summarized = true;
                    info!("upstream reports input too large; summarizing history");
                    shrink_history(envelope)?;
                    continue;
                }
                return Err(GatewayError::ContextOverflow(
                    "input exceeds the context window even after summarization".to_string(),
                ));
            }
            return Err(GatewayError::UpstreamFatal { status, message: body });
        }

        // Streaming phase.
        let opts = StreamOptions {
            first_token_deadline: deadline,
            idle_timeout: Duration::from_secs(ctx.config.stream_idle_timeout.max(1)),
        };
        match parser::run_stream(resp, tx, opts).await {
            Ok(()) => return Ok(()),
            Err(GatewayError::FirstTokenTimeout { .. }) if attempt < max_attempts => {
                info!(attempt, "no first token before deadline; retrying");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Exponential backoff with full jitter: sleep a uniform random duration up
/// to base * 2^(attempt-1), capped.
async fn backoff(attempt: u32) {
    let ceiling = BACKOFF_BASE_MS
        .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
        .min(BACKOFF_CAP_MS);
    let sleep_ms = rand::rng().random_range(0..=ceiling);
    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
}

fn body_indicates_expired(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("expired") || lower.contains("invalid bearer token")
}

fn is_input_too_large(status: u16, body: &str) -> bool {
    if status == 413 {
        return true;
    }
    let lower = body.to_ascii_lowercase();
    status == 400
        && (lower.contains("too large")
            || lower.contains("too long")
            || lower.contains("content_length_exceeds"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StopReason;
    use crate::frames::encode_frame;
    use axum::body::Body;
    use axum::extract::State;
    use axum::routing::post;
    use axum::Router;
    use kiro_auth::store::EnvStore;
    use kiro_auth::{CredentialSource, RefreshAdapter, RefreshCredential};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockUpstream {
        hits: AtomicUsize,
        behavior: Behavior,
    }

    enum Behavior {
        /// Stall for the given millis on attempt 1, stream "pong" afterwards.
        StallFirstAttempt(u64),
        /// 401 on attempt 1, stream afterwards.
        UnauthorizedFirstAttempt,
        /// Always answer 400 input-too-large.
        AlwaysTooLarge,
    }

    async fn upstream_handler(State(mock): State<Arc<MockUpstream>>) -> axum::response::Response {
        let attempt = mock.hits.fetch_add(1, Ordering::SeqCst) + 1;
        let pong = encode_frame(&serde_json::json!({
            "assistantResponseEvent": {"content": "pong"}
        }));
        match &mock.behavior {
            Behavior::StallFirstAttempt(ms) => {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                }
                axum::response::Response::new(Body::from(pong))
            }
            Behavior::UnauthorizedFirstAttempt => {
                if attempt == 1 {
                    axum::response::Response::builder()
                        .status(401)
                        .body(Body::from("unauthorized"))
                        .unwrap()
                } else {
                    axum::response::Response::new(Body::from(pong))
                }
            }
            Behavior::AlwaysTooLarge => axum::response::Response::builder()
                .status(400)
                .body(Body::from("Input is too long for the requested model"))
                .unwrap(),
        }
    }

    async fn spawn_mock(behavior: Behavior) -> (Arc<MockUpstream>, String) {
        let mock = Arc::new(MockUpstream { hits: AtomicUsize::new(0), behavior });
        let refresh = post(|| async {
            axum::Json(serde_json::json!({"accessToken": "at_1", "expiresIn": 3600}))
        });
        let app = Router::new()
            .route("/generateAssistantResponse", post(upstream_handler))
            .route("/refreshToken", refresh)
            .with_state(Arc::clone(&mock));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (mock, format!("http://{addr}"))
    }

    fn manager() -> Arc<CredentialManager> {
        Arc::new(CredentialManager::new(
            RefreshCredential {
                source: CredentialSource::Env,
                refresh_token: "rt".into(),
                client_id: None,
                client_secret: None,
                sso_region: None,
                profile_arn: None,
                scopes: None,
                access_token: None,
                expires_at: None,
            },
            Box::new(EnvStore::new(Some("rt".into()), None)),
            RefreshAdapter::new(reqwest::Client::new()),
        ))
    }

    fn envelope() -> ConversationEnvelope {
        ConversationEnvelope::new(
            "conv".into(),
            crate::envelope::UserInputMessage::text("ping", "claude-haiku-4.5"),
            Vec::new(),
            None,
        )
    }

    async fn run(
        base: &str,
        first_token_timeout: u64,
    ) -> (Vec<SemanticEvent>, Result<(), GatewayError>) {
        let mut config = GatewayConfig::default();
        config.kiro_api_base_url = base.to_string();
        config.kiro_desktop_token_url = format!("{base}/refreshToken");
        config.first_token_timeout = first_token_timeout;
        config.max_retries = 3;

        let manager = manager();
        let client = KiroClient::new();
        let (tx, mut rx) = mpsc::channel(32);
        let mut env = envelope();
        let result = run_with_retries(
            RetryContext { manager: &manager, client: &client, config: &config },
            &mut env,
            &tx,
            |_| Ok(()),
        )
        .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (events, result)
    }

    #[tokio::test]
    async fn first_token_timeout_retries_and_second_attempt_streams() {
        // attempt 1 stalls past the 1s deadline; attempt 2 streams
        let (mock, base) = spawn_mock(Behavior::StallFirstAttempt(2_000)).await;
        let (events, result) = run(&base, 1).await;
        result.unwrap();

        assert_eq!(mock.hits.load(Ordering::SeqCst), 2, "exactly two upstream POSTs");
        assert!(matches!(&events[0], SemanticEvent::Content { text } if text == "pong"));
        assert!(matches!(
            events.last().unwrap(),
            SemanticEvent::StreamEnd { stop_reason: StopReason::EndTurn }
        ));
    }

    #[tokio::test]
    async fn upstream_401_invalidates_and_retries_once() {
        let (mock, base) = spawn_mock(Behavior::UnauthorizedFirstAttempt).await;
        let (events, result) = run(&base, 5).await;
        result.unwrap();
        assert_eq!(mock.hits.load(Ordering::SeqCst), 2);
        assert!(matches!(&events[0], SemanticEvent::Content { text } if text == "pong"));
    }

    #[tokio::test]
    async fn input_too_large_summarizes_once_then_surfaces_overflow() {
        let (mock, base) = spawn_mock(Behavior::AlwaysTooLarge).await;

        let mut config = GatewayConfig::default();
        config.kiro_api_base_url = base.clone();
        config.kiro_desktop_token_url = format!("{base}/refreshToken");
        config.first_token_timeout = 5;

        let manager = manager();
        let client = KiroClient::new();
        let (tx, _rx) = mpsc::channel(32);
        let mut env = envelope();
        let mut shrink_calls = 0;
        let result = run_with_retries(
            RetryContext { manager: &manager, client: &client, config: &config },
            &mut env,
            &tx,
            |_| {
                shrink_calls += 1;
                Ok(())
            },
        )
        .await;

        assert_eq!(shrink_calls, 1, "summarizer runs exactly once per request");
        assert!(matches!(result, Err(GatewayError::ContextOverflow(_))));
        assert_eq!(mock.hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn too_large_detection() {
        assert!(is_input_too_large(413, ""));
        assert!(is_input_too_large(400, "Input is too long."));
        assert!(is_input_too_large(400, "CONTENT_LENGTH_EXCEEDS_THRESHOLD"));
        assert!(!is_input_too_large(400, "malformed request"));
        assert!(!is_input_too_large(422, "too large")); // only 400/413 qualify
    }

    #[test]
    fn expired_body_detection() {
        assert!(body_indicates_expired("The security token included is expired"));
        assert!(!body_indicates_expired("improperly formed request"));
    }
}
