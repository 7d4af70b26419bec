use serde::Deserialize;
use serde_json::Value;

/// Logical events reconstructed from the upstream frame stream. Delivered to
/// the response translators in strict arrival order.
#[derive(Debug, Clone)]
pub enum SemanticEvent {
    /// Incremental assistant text.
    Content { text: String },

    /// Incremental reasoning text (extracted from thinking spans).
    Thinking { text: String },

    /// A completed tool call. `args` is the concatenation of all input
    /// fragments in arrival order and may still be invalid JSON; the
    /// translator resolves that at response-build time.
    ToolUse {
        id: String,
        name: String,
        args: String,
    },

    /// Context-window usage percentage reported by upstream metadata.
    ContextUsage { percent: f64 },

    /// Stream completed.
    StreamEnd { stop_reason: StopReason },

    /// Error after the first token, surfaced in-band because bytes already
    /// reached the client.
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

impl StopReason {
    pub fn anthropic(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
        }
    }

    pub fn openai(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "stop",
            StopReason::ToolUse => "tool_calls",
            StopReason::MaxTokens => "length",
        }
    }
}

/// One decoded upstream frame. The payload carries at most one discriminator;
/// unknown shapes are preserved as `Other` so the parser can decide to drop
/// or surface them.
#[derive(Debug)]
pub enum KiroEvent {
    AssistantText(String),
    ToolUseFragment {
        tool_use_id: String,
        name: String,
        input: String,
        stop: bool,
    },
    CodeReference,
    Metadata { context_usage: Option<f64> },
    UpstreamError { message: String },
    Other { raw: Value },
}

impl KiroEvent {
    /// Classify one frame payload by its discriminator field.
    pub fn from_frame(frame: &Value) -> KiroEvent {
        if let Some(event) = frame.get("assistantResponseEvent") {
            let text = event
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return KiroEvent::AssistantText(text);
        }

        if let Some(event) = frame.get("toolUseEvent") {
            if let Ok(fragment) = serde_json::from_value::<ToolUseEventWire>(event.clone()) {
                return KiroEvent::ToolUseFragment {
                    tool_use_id: fragment.tool_use_id,
                    name: fragment.name.unwrap_or_default(),
                    input: fragment.input.unwrap_or_default(),
                    stop: fragment.stop.unwrap_or(false),
                };
            }
            return KiroEvent::Other { raw: frame.clone() };
        }

        if frame.get("codeReferenceEvent").is_some() {
            return KiroEvent::CodeReference;
        }

        if let Some(event) = frame.get("messageMetadataEvent") {
            let context_usage = event
                .get("contextUsage")
                .and_then(Value::as_f64)
                .or_else(|| {
                    event
                        .get("contextUsage")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok())
                });
            return KiroEvent::Metadata { context_usage };
        }

        // Provider error envelopes come in a couple of shapes: an AWS
        // `__type` + `message` pair, or a bare `{"error": ...}` object.
        if let Some(message) = frame.get("message").and_then(Value::as_str) {
            if frame.get("__type").is_some() {
                return KiroEvent::UpstreamError { message: message.to_string() };
            }
        }
        if let Some(error) = frame.get("error") {
            let message = error
                .as_str()
                .map(str::to_string)
                .or_else(|| {
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| error.to_string());
            return KiroEvent::UpstreamError { message };
        }

        KiroEvent::Other { raw: frame.clone() }
    }

    /// Whether this frame counts as the stream's first meaningful token for
    /// watchdog purposes.
    pub fn is_meaningful(&self) -> bool {
        match self {
            KiroEvent::AssistantText(text) => !text.is_empty(),
            KiroEvent::ToolUseFragment { name, input, .. } => {
                !name.is_empty() || !input.is_empty()
            }
            _ => false,
        }
    }
}

#[derive(Deserialize)]
struct ToolUseEventWire {
    #[serde(rename = "toolUseId")]
    tool_use_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    stop: Option<bool>,
}
