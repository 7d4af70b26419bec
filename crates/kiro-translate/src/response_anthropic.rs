//! Semantic events → Anthropic Messages API responses (SSE and aggregate).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use futures_util::Stream;
use kiro_core::config::ReasoningHandling;
use kiro_core::GatewayError;
use kiro_upstream::{SemanticEvent, StopReason};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::ids;
use crate::tokens::{self, ModelFamily};
use crate::truncation::{self, TruncationCache};

const PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct ResponseParams {
    pub model: String,
    pub family: ModelFamily,
    pub reasoning: ReasoningHandling,
    pub input_tokens: u32,
}

/// One wire event: SSE event name plus its JSON payload. Split from the
/// axum `Event` type so the sequencing logic stays assertable in tests.
#[derive(Debug, Clone)]
pub struct WireEvent {
    pub name: &'static str,
    pub payload: Value,
}

fn wire(name: &'static str, payload: Value) -> WireEvent {
    WireEvent { name, payload }
}

/// Axum SSE adapter over [`wire_stream`].
pub fn sse_stream(
    rx: mpsc::Receiver<SemanticEvent>,
    params: ResponseParams,
    cache: Arc<TruncationCache>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    use futures_util::StreamExt;
    wire_stream(rx, params, cache).map(|event| {
        // serde_json keeps non-ASCII as UTF-8; nothing gets escaped
        Ok(Event::default()
            .event(event.name)
            .data(serde_json::to_string(&event.payload).unwrap_or_default()))
    })
}

#[derive(PartialEq, Clone, Copy)]
enum OpenBlock {
    Text,
    Thinking,
}

/// Emit the Anthropic SSE sequence for one logical stream. Well-formedness
/// holds by construction: one `message_start`, balanced block brackets with
/// increasing indices, one `message_delta` + `message_stop` on the happy
/// path, a single `error` event otherwise.
pub fn wire_stream(
    mut rx: mpsc::Receiver<SemanticEvent>,
    params: ResponseParams,
    cache: Arc<TruncationCache>,
) -> impl Stream<Item = WireEvent> {
    async_stream::stream! {
        let message_id = ids::message_id();
        yield wire("message_start", json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "model": params.model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": params.input_tokens, "output_tokens": 0}
            }
        }));

        let mut index: i64 = -1;
        let mut open: Option<OpenBlock> = None;
        let mut full_text = String::new();
        let mut had_tool_use = false;
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );

        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = ping.tick() => {
                    yield wire("ping", json!({"type": "ping"}));
                    continue;
                }
            };

            match event {
                SemanticEvent::Content { text } => {
                    if open != Some(OpenBlock::Text) {
                        if open.take().is_some() {
                            yield wire("content_block_stop",
                                json!({"type": "content_block_stop", "index": index}));
                        }
                        index += 1;
                        open = Some(OpenBlock::Text);
                        yield wire("content_block_start", json!({
                            "type": "content_block_start",
                            "index": index,
                            "content_block": {"type": "text", "text": ""}
                        }));
                    }
                    full_text.push_str(&text);
                    yield wire("content_block_delta", json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text}
                    }));
                }
                SemanticEvent::Thinking { text } => {
                    let as_text = match params.reasoning {
                        ReasoningHandling::Strip => continue,
                        ReasoningHandling::IncludeAsText => true,
                        ReasoningHandling::EmitBlock => false,
                    };
                    if as_text {
                        if open != Some(OpenBlock::Text) {
                            if open.take().is_some() {
                                yield wire("content_block_stop",
                                    json!({"type": "content_block_stop", "index": index}));
                            }
                            index += 1;
                            open = Some(OpenBlock::Text);
                            yield wire("content_block_start", json!({
                                "type": "content_block_start",
                                "index": index,
                                "content_block": {"type": "text", "text": ""}
                            }));
                        }
                        full_text.push_str(&text);
                        yield wire("content_block_delta", json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {"type": "text_delta", "text": text}
                        }));
                    } else {
                        if open != Some(OpenBlock::Thinking) {
                            if open.take().is_some() {
                                yield wire("content_block_stop",
                                    json!({"type": "content_block_stop", "index": index}));
                            }
                            index += 1;
                            open = Some(OpenBlock::Thinking);
                            yield wire("content_block_start", json!({
                                "type": "content_block_start",
                                "index": index,
                                "content_block": {
                                    "type": "thinking",
                                    "thinking": "",
                                    "signature": ids::thinking_signature()
                                }
                            }));
                        }
                        yield wire("content_block_delta", json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {"type": "thinking_delta", "thinking": text}
                        }));
                    }
                }
                SemanticEvent::ToolUse { id, name, args } => {
                    if open.take().is_some() {
                        yield wire("content_block_stop",
                            json!({"type": "content_block_stop", "index": index}));
                    }
                    had_tool_use = true;
                    let emitted = match truncation::diagnose_tool_args(&args) {
                        None => args,
                        Some(diagnosis) => {
                            debug!(tool_use_id = %id, "tool args truncated; recording recovery");
                            cache.save_tool_truncation(&id, &name, diagnosis);
                            "{}".to_string()
                        }
                    };
                    index += 1;
                    yield wire("content_block_start", json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
                    }));
                    yield wire("content_block_delta", json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "input_json_delta", "partial_json": emitted}
                    }));
                    yield wire("content_block_stop",
                        json!({"type": "content_block_stop", "index": index}));
                }
                SemanticEvent::ContextUsage { percent } => {
                    debug!(percent, "upstream context usage");
                }
                SemanticEvent::StreamEnd { stop_reason } => {
                    if open.take().is_some() {
                        yield wire("content_block_stop",
                            json!({"type": "content_block_stop", "index": index}));
                    }
                    if truncation::content_looks_truncated(&full_text, had_tool_use, stop_reason) {
                        cache.save_content_truncation(&full_text);
                    }
                    let output_tokens = tokens::count_text(&full_text, params.family);
                    yield wire("message_delta", json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": stop_reason.anthropic(), "stop_sequence": null},
                        "usage": {"output_tokens": output_tokens}
                    }));
                    yield wire("message_stop", json!({"type": "message_stop"}));
                    break;
                }
                SemanticEvent::Error { message } => {
                    yield wire("error", json!({
                        "type": "error",
                        "error": {"type": "api_error", "message": message}
                    }));
                    break;
                }
            }
        }
    }
}

/// Drain the whole stream into one `message` JSON document (stream: false).
pub async fn collect_response(
    mut rx: mpsc::Receiver<SemanticEvent>,
    params: ResponseParams,
    cache: &TruncationCache,
) -> Result<Value, GatewayError> {
    let mut text = String::new();
    let mut thinking = String::new();
    let mut tool_blocks: Vec<Value> = Vec::new();
    let mut had_tool_use = false;
    let mut stop_reason = StopReason::EndTurn;

    while let Some(event) = rx.recv().await {
        match event {
            SemanticEvent::Content { text: chunk } => text.push_str(&chunk),
            SemanticEvent::Thinking { text: chunk } => match params.reasoning {
                ReasoningHandling::Strip => {}
                ReasoningHandling::IncludeAsText => text.push_str(&chunk),
                ReasoningHandling::EmitBlock => thinking.push_str(&chunk),
            },
            SemanticEvent::ToolUse { id, name, args } => {
                had_tool_use = true;
                let input = match truncation::diagnose_tool_args(&args) {
                    None => serde_json::from_str(&args).unwrap_or_else(|_| json!({})),
                    Some(diagnosis) => {
                        cache.save_tool_truncation(&id, &name, diagnosis);
                        json!({})
                    }
                };
                tool_blocks.push(json!({
                    "type": "tool_use", "id": id, "name": name, "input": input
                }));
            }
            SemanticEvent::ContextUsage { .. } => {}
            SemanticEvent::StreamEnd { stop_reason: reason } => {
                stop_reason = reason;
                break;
            }
            SemanticEvent::Error { message } => {
                return Err(GatewayError::StreamBroken(message));
            }
        }
    }

    if truncation::content_looks_truncated(&text, had_tool_use, stop_reason) {
        cache.save_content_truncation(&text);
    }

    let mut content: Vec<Value> = Vec::new();
    if !thinking.is_empty() {
        content.push(json!({
            "type": "thinking",
            "thinking": thinking,
            "signature": ids::thinking_signature()
        }));
    }
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }
    content.extend(tool_blocks);

    let output_tokens = tokens::count_text(&text, params.family);
    Ok(json!({
        "id": ids::message_id(),
        "type": "message",
        "role": "assistant",
        "model": params.model,
        "content": content,
        "stop_reason": stop_reason.anthropic(),
        "stop_sequence": null,
        "usage": {"input_tokens": params.input_tokens, "output_tokens": output_tokens}
    }))
}
