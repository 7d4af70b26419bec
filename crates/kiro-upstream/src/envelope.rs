//! Canonical upstream request envelope.
//!
//! Everything the gateway accepts, Anthropic or OpenAI shaped, is reduced
//! to this one `conversationState` document before dispatch. Field names are
//! the upstream's camelCase wire names.

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const TASK_TYPE_VIBE: &str = "vibe";
pub const TRIGGER_MANUAL: &str = "MANUAL";
pub const ORIGIN_AI_EDITOR: &str = "AI_EDITOR";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEnvelope {
    pub conversation_state: ConversationState,
    /// Attached for Desktop credentials only; OIDC users are rejected with a
    /// 403 when one is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    /// Fresh per outbound attempt.
    pub agent_continuation_id: String,
    pub agent_task_type: String,
    pub chat_trigger_type: String,
    /// Stable across a dialogue so retries and follow-ups share it.
    pub conversation_id: String,
    pub current_message: CurrentMessage,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    pub model_id: String,
    pub origin: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub images: Vec<ImageBlock>,
    pub user_input_message_context: UserInputMessageContext,
}

impl UserInputMessage {
    pub fn text(content: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model_id: model_id.into(),
            origin: ORIGIN_AI_EDITOR.to_string(),
            images: Vec::new(),
            user_input_message_context: UserInputMessageContext::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    pub tools: Vec<ToolEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResultEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputSchema {
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEntry {
    pub tool_use_id: String,
    pub content: Vec<ToolResultContent>,
    /// "success" or "error".
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResultContent {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBlock {
    /// Media subtype, e.g. "png" or "jpeg".
    pub format: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSource {
    /// Base64-encoded image bytes.
    pub bytes: String,
}

/// History alternates user and assistant turns, each wrapped in a single-key
/// object naming its kind.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryEntry {
    UserInputMessage(UserInputMessage),
    AssistantResponseMessage(AssistantResponseMessage),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_uses: Vec<AssistantToolUse>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ConversationEnvelope {
    pub fn new(
        conversation_id: String,
        current: UserInputMessage,
        history: Vec<HistoryEntry>,
        profile_arn: Option<String>,
    ) -> Self {
        Self {
            conversation_state: ConversationState {
                agent_continuation_id: Uuid::new_v4().to_string(),
                agent_task_type: TASK_TYPE_VIBE.to_string(),
                chat_trigger_type: TRIGGER_MANUAL.to_string(),
                conversation_id,
                current_message: CurrentMessage { user_input_message: current },
                history,
            },
            profile_arn,
        }
    }

    /// Each outbound attempt gets its own continuation id; the conversation
    /// id stays put so retries are linked server-side.
    pub fn regenerate_continuation_id(&mut self) {
        self.conversation_state.agent_continuation_id = Uuid::new_v4().to_string();
    }
}

/// Deterministic conversation id: SHA-256 of the system preamble plus the
/// first user message, folded into UUID shape. Identical dialogues (and
/// retries of one) land on the same id.
pub fn derive_conversation_id(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let hex = hex::encode(&digest[..16]);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_to_upstream_wire_shape() {
        let envelope = ConversationEnvelope::new(
            "conv-1".into(),
            UserInputMessage::text("Hello!", "claude-haiku-4.5"),
            Vec::new(),
            Some("arn:aws:codewhisperer:us-east-1:1:profile/X".into()),
        );
        let json = serde_json::to_value(&envelope).unwrap();

        let state = &json["conversationState"];
        assert_eq!(state["agentTaskType"], "vibe");
        assert_eq!(state["chatTriggerType"], "MANUAL");
        assert_eq!(state["conversationId"], "conv-1");
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["content"],
            "Hello!"
        );
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["origin"],
            "AI_EDITOR"
        );
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["userInputMessageContext"]["tools"],
            serde_json::json!([])
        );
        assert!(json["profileArn"].is_string());
    }

    #[test]
    fn profile_arn_absent_when_none() {
        let envelope = ConversationEnvelope::new(
            "conv-1".into(),
            UserInputMessage::text("hi", "claude-haiku-4.5"),
            Vec::new(),
            None,
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("profileArn").is_none());
    }

    #[test]
    fn history_entries_wrap_in_kind_keys() {
        let history = vec![
            HistoryEntry::UserInputMessage(UserInputMessage::text("q", "m")),
            HistoryEntry::AssistantResponseMessage(AssistantResponseMessage {
                content: "a".into(),
                tool_uses: vec![AssistantToolUse {
                    tool_use_id: "tu_1".into(),
                    name: "grep".into(),
                    input: serde_json::json!({"pattern": "x"}),
                }],
            }),
        ];
        let json = serde_json::to_value(&history).unwrap();
        assert!(json[0].get("userInputMessage").is_some());
        assert!(json[1].get("assistantResponseMessage").is_some());
        assert_eq!(
            json[1]["assistantResponseMessage"]["toolUses"][0]["toolUseId"],
            "tu_1"
        );
    }

    #[test]
    fn conversation_id_is_stable_and_uuid_shaped() {
        let a = derive_conversation_id("system|hello");
        let b = derive_conversation_id("system|hello");
        let c = derive_conversation_id("system|other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 36);
        assert_eq!(a.matches('-').count(), 4);
    }

    #[test]
    fn continuation_id_changes_per_attempt() {
        let mut envelope = ConversationEnvelope::new(
            "conv".into(),
            UserInputMessage::text("hi", "m"),
            Vec::new(),
            None,
        );
        let first = envelope.conversation_state.agent_continuation_id.clone();
        envelope.regenerate_continuation_id();
        assert_ne!(first, envelope.conversation_state.agent_continuation_id);
        assert_eq!(envelope.conversation_state.conversation_id, "conv");
    }
}
