//! Anthropic Messages API types (v2023-06-01 surface).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub tools: Vec<AnthropicTool>,
    #[serde(default)]
    pub tool_choice: Option<AnthropicToolChoice>,
    #[serde(default)]
    pub stream: bool,
    // Sampling knobs the upstream does not expose; accepted for wire
    // compatibility.
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// `system` accepts a bare string or an array of system blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Concatenated system text. Cache-control hints are dropped; the
    /// upstream has no equivalent.
    pub fn joined(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
    #[serde(default)]
    pub cache_control: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

/// tool_result content: a bare string or nested blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    pub fn joined(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicToolChoice {
    Auto,
    Any,
    Tool { name: String },
    None,
}

// ── Response/error shapes ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct AnthropicErrorResponse {
    #[serde(rename = "type")]
    pub response_type: &'static str,
    pub error: AnthropicErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct AnthropicErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl AnthropicErrorResponse {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            response_type: "error",
            error: AnthropicErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_string_content_parses() {
        let req: MessagesRequest = serde_json::from_str(
            r#"{"model":"claude-haiku-4.5","max_tokens":16,
                "messages":[{"role":"user","content":"ping"}]}"#,
        )
        .unwrap();
        assert_eq!(req.model, "claude-haiku-4.5");
        assert!(!req.stream);
        assert!(matches!(req.messages[0].content, MessageContent::Text(ref t) if t == "ping"));
    }

    #[test]
    fn block_content_with_tools_parses() {
        let req: MessagesRequest = serde_json::from_str(
            r#"{
                "model": "claude-sonnet-4.5", "max_tokens": 100,
                "system": [{"type":"text","text":"Be terse.","cache_control":{"type":"ephemeral"}}],
                "tools": [{"name":"get_weather","description":"d","input_schema":{"type":"object"}}],
                "tool_choice": {"type":"tool","name":"get_weather"},
                "messages": [
                    {"role":"user","content":[{"type":"text","text":"hi"}]},
                    {"role":"assistant","content":[
                        {"type":"tool_use","id":"tu_1","name":"get_weather","input":{"city":"Oslo"}}
                    ]},
                    {"role":"user","content":[
                        {"type":"tool_result","tool_use_id":"tu_1","content":"rainy","is_error":false}
                    ]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(req.system.unwrap().joined(), "Be terse.");
        assert!(matches!(
            req.tool_choice,
            Some(AnthropicToolChoice::Tool { ref name }) if name == "get_weather"
        ));
        let MessageContent::Blocks(blocks) = &req.messages[2].content else {
            panic!("expected blocks");
        };
        assert!(matches!(
            &blocks[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "tu_1"
        ));
    }

    #[test]
    fn tool_result_content_accepts_nested_blocks() {
        let content: ToolResultContent =
            serde_json::from_str(r#"[{"type":"text","text":"a"},{"type":"text","text":"b"}]"#)
                .unwrap();
        assert_eq!(content.joined(), "a\nb");
    }

    #[test]
    fn image_sources_parse_both_kinds() {
        let b64: ImageSource = serde_json::from_str(
            r#"{"type":"base64","media_type":"image/png","data":"aGk="}"#,
        )
        .unwrap();
        assert!(matches!(b64, ImageSource::Base64 { .. }));

        let url: ImageSource =
            serde_json::from_str(r#"{"type":"url","url":"https://example.com/x.png"}"#).unwrap();
        assert!(matches!(url, ImageSource::Url { .. }));
    }

    #[test]
    fn error_response_shape() {
        let err = AnthropicErrorResponse::new("invalid_request_error", "bad");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(json["error"]["message"], "bad");
    }
}
