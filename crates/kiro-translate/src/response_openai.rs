//! Semantic events → OpenAI Chat Completions responses (SSE and aggregate).

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::Event;
use futures_util::Stream;
use kiro_core::config::ReasoningHandling;
use kiro_core::GatewayError;
use kiro_upstream::{SemanticEvent, StopReason};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::ids;
use crate::openai::{
    ChatCompletionResponse, Choice, DeltaFunction, DeltaToolCall, ResponseDelta, ResponseFunction,
    ResponseMessage, ResponseToolCall, Usage,
};
use crate::tokens::{self, ModelFamily};
use crate::truncation::{self, TruncationCache};

#[derive(Clone)]
pub struct ResponseParams {
    pub model: String,
    pub family: ModelFamily,
    pub reasoning: ReasoningHandling,
    pub input_tokens: u32,
}

/// One outbound SSE item: a JSON chunk or the literal `[DONE]` terminator.
#[derive(Debug, Clone)]
pub enum OutItem {
    Chunk(Value),
    Done,
}

/// Axum SSE adapter over [`chunk_stream`].
pub fn sse_stream(
    rx: mpsc::Receiver<SemanticEvent>,
    params: ResponseParams,
    cache: Arc<TruncationCache>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    use futures_util::StreamExt;
    chunk_stream(rx, params, cache).map(|item| {
        Ok(match item {
            OutItem::Chunk(value) => Event::default()
                .data(serde_json::to_string(&value).unwrap_or_default()),
            OutItem::Done => Event::default().data("[DONE]"),
        })
    })
}

/// One `chat.completion.chunk` per semantic event, a finish chunk, then
/// `[DONE]`. Stream errors emit an OpenAI error object and end the stream
/// without the terminator, mirroring how the platform reports mid-stream
/// failures.
pub fn chunk_stream(
    mut rx: mpsc::Receiver<SemanticEvent>,
    params: ResponseParams,
    cache: Arc<TruncationCache>,
) -> impl Stream<Item = OutItem> {
    async_stream::stream! {
        let id = ids::chat_completion_id();
        let created = chrono::Utc::now().timestamp();
        let mut sent_role = false;
        let mut tool_index: u32 = 0;
        let mut full_text = String::new();
        let mut had_tool_use = false;

        let chunk = |delta: ResponseDelta, finish: Option<String>| {
            ChatCompletionResponse {
                id: id.clone(),
                object: "chat.completion.chunk",
                created,
                model: params.model.clone(),
                choices: vec![Choice {
                    index: 0,
                    message: None,
                    delta: Some(delta),
                    finish_reason: finish,
                }],
                usage: None,
            }
        };

        while let Some(event) = rx.recv().await {
            match event {
                SemanticEvent::Content { text } => {
                    full_text.push_str(&text);
                    let delta = ResponseDelta {
                        role: (!sent_role).then_some("assistant"),
                        content: Some(text),
                        tool_calls: Vec::new(),
                    };
                    sent_role = true;
                    yield OutItem::Chunk(serde_json::to_value(chunk(delta, None))
                        .unwrap_or(Value::Null));
                }
                SemanticEvent::Thinking { text } => {
                    // OpenAI has no thinking channel; emit_block degrades to
                    // include-as-text is wrong, so anything but explicit
                    // include is stripped here
                    if params.reasoning == ReasoningHandling::IncludeAsText {
                        full_text.push_str(&text);
                        let delta = ResponseDelta {
                            role: (!sent_role).then_some("assistant"),
                            content: Some(text),
                            tool_calls: Vec::new(),
                        };
                        sent_role = true;
                        yield OutItem::Chunk(serde_json::to_value(chunk(delta, None))
                            .unwrap_or(Value::Null));
                    }
                }
                SemanticEvent::ToolUse { id: call_id, name, args } => {
                    had_tool_use = true;
                    let arguments = match truncation::diagnose_tool_args(&args) {
                        None => args,
                        Some(diagnosis) => {
                            cache.save_tool_truncation(&call_id, &name, diagnosis);
                            "{}".to_string()
                        }
                    };
                    let delta = ResponseDelta {
                        role: (!sent_role).then_some("assistant"),
                        content: None,
                        tool_calls: vec![DeltaToolCall {
                            index: tool_index,
                            id: Some(call_id),
                            call_type: Some("function"),
                            function: DeltaFunction {
                                name: Some(name),
                                arguments: Some(arguments),
                            },
                        }],
                    };
                    sent_role = true;
                    tool_index += 1;
                    yield OutItem::Chunk(serde_json::to_value(chunk(delta, None))
                        .unwrap_or(Value::Null));
                }
                SemanticEvent::ContextUsage { .. } => {}
                SemanticEvent::StreamEnd { stop_reason } => {
                    if truncation::content_looks_truncated(&full_text, had_tool_use, stop_reason) {
                        cache.save_content_truncation(&full_text);
                    }
                    yield OutItem::Chunk(serde_json::to_value(chunk(
                        ResponseDelta::default(),
                        Some(stop_reason.openai().to_string()),
                    ))
                    .unwrap_or(Value::Null));
                    yield OutItem::Done;
                    break;
                }
                SemanticEvent::Error { message } => {
                    yield OutItem::Chunk(json!({
                        "error": {"message": message, "type": "api_error"}
                    }));
                    break;
                }
            }
        }
    }
}

/// Drain the whole stream into one `chat.completion` object (stream: false).
/// Tool-call arguments come out as a single JSON string, never fragmented.
pub async fn collect_response(
    mut rx: mpsc::Receiver<SemanticEvent>,
    params: ResponseParams,
    cache: &TruncationCache,
) -> Result<ChatCompletionResponse, GatewayError> {
    let mut text = String::new();
    let mut tool_calls: Vec<ResponseToolCall> = Vec::new();
    let mut had_tool_use = false;
    let mut stop_reason = StopReason::EndTurn;

    while let Some(event) = rx.recv().await {
        match event {
            SemanticEvent::Content { text: chunk } => text.push_str(&chunk),
            SemanticEvent::Thinking { text: chunk } => {
                if params.reasoning == ReasoningHandling::IncludeAsText {
                    text.push_str(&chunk);
                }
            }
            SemanticEvent::ToolUse { id, name, args } => {
                had_tool_use = true;
                let arguments = match truncation::diagnose_tool_args(&args) {
                    None => args,
                    Some(diagnosis) => {
                        cache.save_tool_truncation(&id, &name, diagnosis);
                        "{}".to_string()
                    }
                };
                tool_calls.push(ResponseToolCall {
                    id,
                    call_type: "function",
                    function: ResponseFunction { name, arguments },
                });
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

    let completion_tokens = tokens::count_text(&text, params.family);
    Ok(ChatCompletionResponse {
        id: ids::chat_completion_id(),
        object: "chat.completion",
        created: chrono::Utc::now().timestamp(),
        model: params.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: Some(ResponseMessage {
                role: "assistant",
                content: (!text.is_empty()).then_some(text),
                tool_calls,
            }),
            delta: None,
            finish_reason: Some(stop_reason.openai().to_string()),
        }],
        usage: Some(Usage {
            prompt_tokens: params.input_tokens,
            completion_tokens,
            total_tokens: params.input_tokens + completion_tokens,
        }),
    })
}
