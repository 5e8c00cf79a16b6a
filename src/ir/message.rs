use serde::{Deserialize, Serialize};
use std::fmt;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Where an image block's bytes come from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Url {
        url: String,
    },
    Base64 {
        media_type: String,
        data: String,
    },
}

/// One block of structured message content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
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
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// Message content: a bare string or an ordered list of blocks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of the content, ignoring non-text blocks.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// All tool-use blocks in order.
    pub fn tool_uses(&self) -> Vec<&ContentBlock> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|block| matches!(block, ContentBlock::ToolUse { .. }))
                .collect(),
        }
    }

    /// Collapse a single text block to bare text content.
    pub fn from_blocks(mut blocks: Vec<ContentBlock>) -> Self {
        if blocks.len() == 1 && matches!(blocks[0], ContentBlock::Text { .. }) {
            if let ContentBlock::Text { text } = blocks.remove(0) {
                return MessageContent::Text(text);
            }
        }
        MessageContent::Blocks(blocks)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Blocks(blocks) => blocks.is_empty(),
        }
    }

    /// True when there is neither text nor a tool-use block.
    pub fn lacks_substance(&self) -> bool {
        self.text().is_empty() && self.tool_uses().is_empty()
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

/// A single message in the canonical conversation shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IrMessage {
    pub role: Role,
    pub content: MessageContent,
    /// Participant name; required when `role == Tool`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl IrMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            name: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            name: None,
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
            name: None,
        }
    }

    pub fn tool(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(text.into()),
            name: Some(name.into()),
        }
    }

    /// Plain text view of the message content.
    pub fn text(&self) -> String {
        self.content.text()
    }
}

impl fmt::Display for IrMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.role, self.content.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_text_from_blocks() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text {
                text: "Hello ".to_string(),
            },
            ContentBlock::ToolUse {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                input: serde_json::json!({}),
            },
            ContentBlock::Text {
                text: "world".to_string(),
            },
        ]);
        assert_eq!(content.text(), "Hello world");
        assert_eq!(content.tool_uses().len(), 1);
    }

    #[test]
    fn test_lacks_substance() {
        let empty = MessageContent::Text(String::new());
        assert!(empty.lacks_substance());

        let tool_only = MessageContent::Blocks(vec![ContentBlock::ToolUse {
            id: "call_1".to_string(),
            name: "lookup".to_string(),
            input: serde_json::json!({"q": "x"}),
        }]);
        assert!(!tool_only.lacks_substance());
    }

    #[test]
    fn test_content_block_serde_tags() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "call_1".to_string(),
            content: "42".to_string(),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["tool_use_id"], "call_1");
    }

    #[test]
    fn test_image_source_variants() {
        let url = ImageSource::Url {
            url: "https://example.com/cat.png".to_string(),
        };
        let json = serde_json::to_value(&url).unwrap();
        assert_eq!(json["type"], "url");

        let b64 = ImageSource::Base64 {
            media_type: "image/png".to_string(),
            data: "aGVsbG8=".to_string(),
        };
        let json = serde_json::to_value(&b64).unwrap();
        assert_eq!(json["type"], "base64");
        assert_eq!(json["media_type"], "image/png");
    }

    #[test]
    fn test_message_display() {
        let msg = IrMessage::user("hi");
        assert_eq!(msg.to_string(), "user: hi");
    }
}
