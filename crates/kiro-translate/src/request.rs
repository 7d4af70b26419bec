//! Inbound request translation: Anthropic or OpenAI shape → canonical
//! upstream envelope.
//!
//! Order matters and follows one pipeline for both dialects: validate,
//! fold the system prompt, normalize images, repair tool-result references,
//! inject truncation recovery, map tools, then check the context window.

use kiro_core::config::GatewayConfig;
use kiro_core::GatewayError;
use kiro_upstream::envelope::{
    derive_conversation_id, AssistantResponseMessage, AssistantToolUse, ConversationEnvelope,
    HistoryEntry, ImageBlock, ImageSource as UpstreamImageSource, InputSchema, ToolEntry,
    ToolResultContent as UpstreamToolResultContent, ToolResultEntry, ToolSpecification,
    UserInputMessage,
};
use kiro_upstream::models::{ModelInfo, ModelInfoCache};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::anthropic::{
    AnthropicToolChoice, ContentBlock, ImageSource, MessagesRequest, ToolResultContent,
};
use crate::images;
use crate::message::{Block, LogicalMessage, Role};
use crate::openai::{ChatCompletionsRequest, OpenAiContent, OpenAiPart, OpenAiToolChoice};
use crate::tokens::{self, ModelFamily};
use crate::truncation::TruncationCache;

/// Tokens held back from the model's advertised input window.
const CONTEXT_HEADROOM: u32 = 1024;

pub struct TranslateDeps<'a> {
    pub config: &'a GatewayConfig,
    pub models: &'a ModelInfoCache,
    pub truncation: &'a TruncationCache,
    pub http: &'a reqwest::Client,
    /// Resolved per-credential profile ARN (None for OIDC users).
    pub profile_arn: Option<String>,
}

#[derive(Debug)]
pub struct TranslatedRequest {
    pub envelope: ConversationEnvelope,
    pub model: ModelInfo,
    pub requested_model: String,
    pub family: ModelFamily,
    pub input_tokens: u32,
}

/// Provider-neutral tool definition.
struct ToolDef {
    name: String,
    description: String,
    schema: Value,
}

enum ToolDirective {
    Auto,
    Any,
    Named(String),
    /// Strip tools entirely.
    None,
}

pub async fn translate_anthropic(
    req: &MessagesRequest,
    deps: &TranslateDeps<'_>,
) -> Result<TranslatedRequest, GatewayError> {
    let system = req.system.as_ref().map(|s| s.joined()).unwrap_or_default();
    let messages = normalize_anthropic_messages(&req.messages, deps.http).await?;

    let tools: Vec<ToolDef> = req
        .tools
        .iter()
        .map(|t| ToolDef {
            name: t.name.clone(),
            description: t.description.clone().unwrap_or_default(),
            schema: t.input_schema.clone(),
        })
        .collect();
    let directive = match req.tool_choice {
        None | Some(AnthropicToolChoice::Auto) => ToolDirective::Auto,
        Some(AnthropicToolChoice::Any) => ToolDirective::Any,
        Some(AnthropicToolChoice::Tool { ref name }) => ToolDirective::Named(name.clone()),
        Some(AnthropicToolChoice::None) => ToolDirective::None,
    };

    build(&req.model, system, messages, tools, directive, deps).await
}

pub async fn translate_openai(
    req: &ChatCompletionsRequest,
    deps: &TranslateDeps<'_>,
) -> Result<TranslatedRequest, GatewayError> {
    let (system, messages) = normalize_openai_messages(&req.messages, deps.http).await?;

    let tools: Vec<ToolDef> = req
        .tools
        .iter()
        .filter(|t| t.tool_type == "function")
        .map(|t| ToolDef {
            name: t.function.name.clone(),
            description: t.function.description.clone().unwrap_or_default(),
            schema: t.function.parameters.clone().unwrap_or_else(|| json!({"type": "object"})),
        })
        .collect();
    let directive = match req.tool_choice {
        None => ToolDirective::Auto,
        Some(OpenAiToolChoice::Mode(ref mode)) => match mode.as_str() {
            "none" => ToolDirective::None,
            "required" => ToolDirective::Any,
            _ => ToolDirective::Auto,
        },
        Some(OpenAiToolChoice::Named { ref function }) => {
            ToolDirective::Named(function.name.clone())
        }
    };

    build(&req.model, system, messages, tools, directive, deps).await
}

// ── Normalization to logical messages ────────────────────────────────────────

async fn normalize_anthropic_messages(
    messages: &[crate::anthropic::AnthropicMessage],
    http: &reqwest::Client,
) -> Result<Vec<LogicalMessage>, GatewayError> {
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        let role = Role::parse(&msg.role)
            .ok_or_else(|| GatewayError::RequestInvalid(format!("unknown role '{}'", msg.role)))?;
        let blocks = match &msg.content {
            crate::anthropic::MessageContent::Text(text) => vec![Block::Text(text.clone())],
            crate::anthropic::MessageContent::Blocks(blocks) => {
                let mut converted = Vec::with_capacity(blocks.len());
                for block in blocks {
                    converted.push(convert_anthropic_block(block, http).await?);
                }
                converted
            }
        };
        out.push(LogicalMessage { role, blocks });
    }
    Ok(out)
}

async fn convert_anthropic_block(
    block: &ContentBlock,
    http: &reqwest::Client,
) -> Result<Block, GatewayError> {
    Ok(match block {
        ContentBlock::Text { text } => Block::Text(text.clone()),
        ContentBlock::Image { source } => match source {
            ImageSource::Base64 { media_type, data } => {
                Block::Image { media_type: media_type.clone(), data: data.clone() }
            }
            ImageSource::Url { url } => {
                let img = images::normalize_url(http, url).await?;
                Block::Image { media_type: img.media_type, data: img.data }
            }
        },
        ContentBlock::ToolUse { id, name, input } => Block::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        ContentBlock::ToolResult { tool_use_id, content, is_error } => Block::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: content.as_ref().map(ToolResultContent::joined).unwrap_or_default(),
            is_error: *is_error,
        },
        // Thinking history is not replayed upstream; only its text survives.
        ContentBlock::Thinking { thinking, .. } => Block::Text(thinking.clone()),
    })
}

async fn normalize_openai_messages(
    messages: &[crate::openai::OpenAiMessage],
    http: &reqwest::Client,
) -> Result<(String, Vec<LogicalMessage>), GatewayError> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut out = Vec::with_capacity(messages.len());

    for msg in messages {
        let role = Role::parse(&msg.role)
            .ok_or_else(|| GatewayError::RequestInvalid(format!("unknown role '{}'", msg.role)))?;

        if role == Role::System {
            if let Some(content) = &msg.content {
                system_parts.push(content.joined_text());
            }
            continue;
        }

        if role == Role::Tool {
            let tool_use_id = msg.tool_call_id.clone().ok_or_else(|| {
                GatewayError::RequestInvalid("tool message missing tool_call_id".to_string())
            })?;
            let content = msg.content.as_ref().map(OpenAiContent::joined_text).unwrap_or_default();
            out.push(LogicalMessage {
                role: Role::Tool,
                blocks: vec![Block::ToolResult { tool_use_id, content, is_error: false }],
            });
            continue;
        }

        let mut blocks = Vec::new();
        if let Some(content) = &msg.content {
            match content {
                OpenAiContent::Text(text) => {
                    if !text.is_empty() {
                        blocks.push(Block::Text(text.clone()));
                    }
                }
                OpenAiContent::Parts(parts) => {
                    for part in parts {
                        match part {
                            OpenAiPart::Text { text } => blocks.push(Block::Text(text.clone())),
                            OpenAiPart::ImageUrl { image_url } => {
                                let img = images::normalize_url(http, &image_url.url).await?;
                                blocks.push(Block::Image {
                                    media_type: img.media_type,
                                    data: img.data,
                                });
                            }
                        }
                    }
                }
            }
        }
        for call in &msg.tool_calls {
            // partial or invalid argument JSON collapses to {} here; the
            // model already saw the full args on its own side
            let input = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| {
                warn!(call_id = %call.id, "unparseable tool-call arguments replaced with {{}}");
                json!({})
            });
            blocks.push(Block::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input,
            });
        }
        out.push(LogicalMessage { role, blocks });
    }

    Ok((system_parts.join("\n"), out))
}

// ── Shared envelope construction ─────────────────────────────────────────────

async fn build(
    requested_model: &str,
    system: String,
    mut messages: Vec<LogicalMessage>,
    tools: Vec<ToolDef>,
    directive: ToolDirective,
    deps: &TranslateDeps<'_>,
) -> Result<TranslatedRequest, GatewayError> {
    if messages.is_empty() {
        return Err(GatewayError::RequestInvalid("messages must not be empty".to_string()));
    }

    let model = deps.models.resolve(requested_model).await.ok_or_else(|| {
        GatewayError::RequestInvalid(format!("unknown model '{requested_model}'"))
    })?;
    let family = tokens::family_of(requested_model);

    repair_tool_results(&mut messages);

    let recovery = if deps.config.truncation_recovery {
        collect_recovery(&messages, deps.truncation)
    } else {
        Recovery::default()
    };

    // fold the system prompt into the first user message as a labeled
    // preamble; the upstream has no system slot
    if !system.is_empty() {
        if let Some(first_user) = messages.iter_mut().find(|m| m.role == Role::User) {
            first_user
                .blocks
                .insert(0, Block::Text(format!("<system>\n{system}\n</system>")));
        }
    }

    // content-truncation notice lands at the head of the user message that
    // follows the truncated assistant turn
    if recovery.content_notice {
        if let Some(idx) = index_of_user_after_last_assistant(&messages) {
            messages[idx].blocks.insert(
                0,
                Block::Text(crate::truncation::CONTENT_RECOVERY_NOTICE.to_string()),
            );
        }
    }

    let input_tokens = tokens::count_messages(&messages, family, true);

    let (history, mut current) = to_upstream_messages(messages, &model.id, &recovery)?;

    // tools attach to the current message only
    let effective_tools = match directive {
        ToolDirective::None => Vec::new(),
        _ if !model.supports_tools => {
            if !tools.is_empty() {
                debug!(model = %model.id, "model does not support tools; dropping definitions");
            }
            Vec::new()
        }
        _ => tools,
    };
    if !effective_tools.is_empty() {
        current.user_input_message_context.tools = effective_tools
            .into_iter()
            .map(|t| ToolEntry {
                tool_specification: ToolSpecification {
                    name: t.name,
                    description: t.description,
                    input_schema: InputSchema { json: t.schema },
                },
            })
            .collect();
        current.user_input_message_context.tool_choice = match directive {
            ToolDirective::Auto => Some(json!({"type": "auto"})),
            ToolDirective::Any => Some(json!({"type": "any"})),
            ToolDirective::Named(name) => Some(json!({"type": "tool", "name": name})),
            ToolDirective::None => None,
        };
    }

    let conversation_seed = format!("{system}|{}", first_user_text(&history, &current));
    let envelope = ConversationEnvelope::new(
        derive_conversation_id(&conversation_seed),
        current,
        history,
        deps.profile_arn.clone(),
    );

    let mut translated = TranslatedRequest {
        envelope,
        model: model.clone(),
        requested_model: requested_model.to_string(),
        family,
        input_tokens,
    };

    // pre-flight context check; the retry coordinator may summarize again on
    // an upstream 413
    let budget = model.max_input_tokens.saturating_sub(CONTEXT_HEADROOM);
    if input_tokens > budget {
        crate::summarize::shrink_envelope(&mut translated.envelope, family, budget)?;
        translated.input_tokens =
            crate::summarize::estimate_envelope_tokens(&translated.envelope, family);
    }

    Ok(translated)
}

/// Every tool-result must reference a tool-use that appeared earlier in the
/// same request; orphans demote to plain user text.
fn repair_tool_results(messages: &mut [LogicalMessage]) {
    let mut known_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
    for message in messages.iter_mut() {
        if message.role == Role::Assistant {
            for id in message.tool_use_ids() {
                known_ids.insert(id.to_string());
            }
            continue;
        }
        for block in message.blocks.iter_mut() {
            if let Block::ToolResult { tool_use_id, content, .. } = block {
                if !known_ids.contains(tool_use_id.as_str()) {
                    warn!(tool_use_id = %tool_use_id, "orphan tool result demoted to text");
                    *block = Block::Text(format!("[tool result for {tool_use_id}] {content}"));
                }
            }
        }
    }
}

#[derive(Default)]
struct Recovery {
    /// tool-use-id → synthetic recovery text, consumed during conversion
    tool_notices: std::collections::HashMap<String, String>,
    content_notice: bool,
}

/// Pull any pending truncation records for this history. Retrieval deletes
/// them, so running this twice injects nothing the second time.
fn collect_recovery(messages: &[LogicalMessage], cache: &TruncationCache) -> Recovery {
    let mut recovery = Recovery::default();
    for message in messages {
        if message.role != Role::Assistant {
            continue;
        }
        for id in message.tool_use_ids() {
            if let Some(record) = cache.get_tool_truncation(id) {
                recovery.tool_notices.insert(
                    id.to_string(),
                    crate::truncation::tool_recovery_text(&record.tool_name, &record.diagnosis),
                );
            }
        }
    }
    if let Some(last_assistant) = messages.iter().rev().find(|m| m.role == Role::Assistant) {
        let text = last_assistant.joined_text();
        if !text.is_empty() && cache.get_content_truncation(&text).is_some() {
            recovery.content_notice = true;
        }
    }
    recovery
}

fn index_of_user_after_last_assistant(messages: &[LogicalMessage]) -> Option<usize> {
    let last_assistant = messages.iter().rposition(|m| m.role == Role::Assistant)?;
    messages
        .iter()
        .enumerate()
        .skip(last_assistant + 1)
        .find(|(_, m)| matches!(m.role, Role::User | Role::Tool))
        .map(|(idx, _)| idx)
}

/// Convert logical messages into the upstream's alternating history plus the
/// current user message. Consecutive same-role messages merge.
fn to_upstream_messages(
    messages: Vec<LogicalMessage>,
    model_id: &str,
    recovery: &Recovery,
) -> Result<(Vec<HistoryEntry>, UserInputMessage), GatewayError> {
    let mut entries: Vec<HistoryEntry> = Vec::new();
    let mut pending_tool_notices = recovery.tool_notices.clone();

    for message in messages {
        match message.role {
            Role::User | Role::Tool => {
                let converted = user_message(&message, model_id, &mut pending_tool_notices);
                match entries.last_mut() {
                    Some(HistoryEntry::UserInputMessage(prev)) => merge_user(prev, converted),
                    _ => entries.push(HistoryEntry::UserInputMessage(converted)),
                }
            }
            Role::Assistant => {
                let converted = assistant_message(&message);
                match entries.last_mut() {
                    Some(HistoryEntry::AssistantResponseMessage(prev)) => {
                        if !prev.content.is_empty() && !converted.content.is_empty() {
                            prev.content.push_str("\n\n");
                        }
                        prev.content.push_str(&converted.content);
                        prev.tool_uses.extend(converted.tool_uses);
                    }
                    _ => entries.push(HistoryEntry::AssistantResponseMessage(converted)),
                }
            }
            Role::System => {} // folded earlier
        }
    }

    let Some(HistoryEntry::UserInputMessage(mut current)) = entries.pop() else {
        return Err(GatewayError::RequestInvalid(
            "the final message must come from the user".to_string(),
        ));
    };

    // recovery notices whose tool result never appeared still need delivering
    for (tool_use_id, text) in pending_tool_notices {
        current.user_input_message_context.tool_results.insert(
            0,
            ToolResultEntry {
                tool_use_id,
                content: vec![UpstreamToolResultContent { text }],
                status: "error".to_string(),
            },
        );
    }

    Ok((entries, current))
}

fn user_message(
    message: &LogicalMessage,
    model_id: &str,
    pending_tool_notices: &mut std::collections::HashMap<String, String>,
) -> UserInputMessage {
    let mut out = UserInputMessage::text(String::new(), model_id);
    let mut text_parts: Vec<String> = Vec::new();

    for block in &message.blocks {
        match block {
            Block::Text(text) => text_parts.push(text.clone()),
            Block::Image { media_type, data } => out.images.push(ImageBlock {
                format: images::format_of(media_type),
                source: UpstreamImageSource { bytes: data.clone() },
            }),
            Block::ToolResult { tool_use_id, content, is_error } => {
                // the synthetic acknowledgement goes immediately before the
                // client's own result for the same call
                if let Some(text) = pending_tool_notices.remove(tool_use_id) {
                    out.user_input_message_context.tool_results.push(ToolResultEntry {
                        tool_use_id: tool_use_id.clone(),
                        content: vec![UpstreamToolResultContent { text }],
                        status: "error".to_string(),
                    });
                }
                out.user_input_message_context.tool_results.push(ToolResultEntry {
                    tool_use_id: tool_use_id.clone(),
                    content: vec![UpstreamToolResultContent { text: content.clone() }],
                    status: if *is_error { "error" } else { "success" }.to_string(),
                });
            }
            Block::ToolUse { .. } => {} // never valid on user turns
        }
    }

    out.content = text_parts.join("\n");
    out
}

fn merge_user(prev: &mut UserInputMessage, next: UserInputMessage) {
    if !prev.content.is_empty() && !next.content.is_empty() {
        prev.content.push_str("\n\n");
    }
    prev.content.push_str(&next.content);
    prev.images.extend(next.images);
    prev.user_input_message_context
        .tool_results
        .extend(next.user_input_message_context.tool_results);
}

fn assistant_message(message: &LogicalMessage) -> AssistantResponseMessage {
    let tool_uses = message
        .blocks
        .iter()
        .filter_map(|b| match b {
            Block::ToolUse { id, name, input } => Some(AssistantToolUse {
                tool_use_id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect();
    AssistantResponseMessage { content: message.joined_text(), tool_uses }
}

fn first_user_text(history: &[HistoryEntry], current: &UserInputMessage) -> String {
    for entry in history {
        if let HistoryEntry::UserInputMessage(msg) = entry {
            return msg.content.clone();
        }
    }
    current.content.clone()
}
