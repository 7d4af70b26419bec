//! Provider-neutral message model.
//!
//! Both inbound API shapes reduce to this before envelope construction, so
//! the translation rules (system folding, tool-result repair, recovery
//! injection, token counting) are written once.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "system" | "developer" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Block {
    Text(String),
    /// Base64 bytes plus media type; URL images are fetched and transcoded
    /// before reaching this form.
    Image {
        media_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone)]
pub struct LogicalMessage {
    pub role: Role,
    pub blocks: Vec<Block>,
}

impl LogicalMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self { role, blocks: vec![Block::Text(text.into())] }
    }

    /// All text blocks joined, in order.
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if let Block::Text(text) = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing_accepts_developer_alias() {
        assert_eq!(Role::parse("developer"), Some(Role::System));
        assert_eq!(Role::parse("tool"), Some(Role::Tool));
        assert_eq!(Role::parse("function"), None);
    }

    #[test]
    fn joined_text_skips_non_text_blocks() {
        let msg = LogicalMessage {
            role: Role::Assistant,
            blocks: vec![
                Block::Text("a".into()),
                Block::ToolUse { id: "t".into(), name: "n".into(), input: Value::Null },
                Block::Text("b".into()),
            ],
        };
        assert_eq!(msg.joined_text(), "a\nb");
        assert_eq!(msg.tool_use_ids(), vec!["t"]);
    }
}
