pub mod chat_completions;
pub mod health;
pub mod messages;
pub mod models;

use std::sync::Arc;

use kiro_core::config::{GatewayConfig, EVENT_CHANNEL_CAPACITY};
use kiro_core::GatewayError;
use kiro_translate::TranslatedRequest;
use kiro_upstream::retry::{run_with_retries, RetryContext};
use kiro_upstream::SemanticEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::app::AppState;

/// Spawn the retry coordinator for a translated request. Events flow out of
/// the returned receiver; the handle resolves once the upstream exchange is
/// over (pre-stream failures resolve it with the error and no events).
pub(crate) fn dispatch(
    state: &Arc<AppState>,
    config: &GatewayConfig,
    translated: TranslatedRequest,
) -> (mpsc::Receiver<SemanticEvent>, JoinHandle<Result<(), GatewayError>>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let manager = Arc::clone(&state.credentials);
    let client = state.kiro.clone();
    let config = config.clone();
    let mut envelope = translated.envelope;
    let family = translated.family;
    let budget = translated.model.max_input_tokens.saturating_sub(1024);

    let handle = tokio::spawn(async move {
        run_with_retries(
            RetryContext { manager: &manager, client: &client, config: &config },
            &mut envelope,
            &tx,
            |envelope| kiro_translate::summarize::shrink_envelope(envelope, family, budget),
        )
        .await
    });
    (rx, handle)
}

/// Resolve the coordinator's outcome when the event channel closed without
/// delivering anything.
pub(crate) async fn silent_failure(handle: JoinHandle<Result<(), GatewayError>>) -> GatewayError {
    match handle.await {
        Ok(Err(e)) => e,
        Ok(Ok(())) => {
            GatewayError::UpstreamTransient("upstream closed without producing events".to_string())
        }
        Err(join) => GatewayError::UpstreamTransient(format!("request task failed: {join}")),
    }
}

/// Re-chain a peeked first event in front of the remaining receiver so the
/// SSE translator sees an unbroken stream.
pub(crate) fn rechain(
    first: SemanticEvent,
    mut rest: mpsc::Receiver<SemanticEvent>,
) -> mpsc::Receiver<SemanticEvent> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY + 1);
    tokio::spawn(async move {
        if tx.send(first).await.is_err() {
            return;
        }
        while let Some(event) = rest.recv().await {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    rx
}
