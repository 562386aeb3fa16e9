//! Conversation messages
//!
//! A session keeps its history for its whole lifetime, so binary payloads
//! (images, documents) are swapped for short placeholders before a message
//! is stored. See [`ChatMessage::sanitized`].

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Message role in a chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Outcome of a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

/// One block of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        format: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Document {
        name: String,
        format: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        status: ToolStatus,
        #[serde(default)]
        content: Vec<ContentBlock>,
    },
}

const IMAGE_FORMATS: &[&str] = &["png", "jpeg", "gif", "webp"];

impl ContentBlock {
    /// Create a text block
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Load a file as an attachment block.
    ///
    /// Known image extensions become [`ContentBlock::Image`], everything
    /// else is attached as a document.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .ok_or_else(|| {
                Error::InvalidInput(format!("Attachment has no extension: {}", path.display()))
            })?;
        let format = match extension.as_str() {
            "jpg" => "jpeg".to_string(),
            other => other.to_string(),
        };

        if IMAGE_FORMATS.contains(&format.as_str()) {
            return Ok(Self::Image { format, data });
        }

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document")
            .to_string();
        Ok(Self::Document { name, format, data })
    }

    /// Whether this block (or anything nested in it) carries binary data
    pub fn has_binary(&self) -> bool {
        match self {
            Self::Image { .. } | Self::Document { .. } => true,
            Self::ToolResult { content, .. } => content.iter().any(Self::has_binary),
            Self::Text { .. } | Self::ToolUse { .. } => false,
        }
    }

    /// Replace binary payloads with placeholder text, keeping tool shapes intact
    pub fn sanitized(self) -> Self {
        match self {
            Self::Image { format, data } => Self::Text {
                text: format!("[image attachment omitted: {}, {} bytes]", format, data.len()),
            },
            Self::Document { name, format, data } => Self::Text {
                text: format!(
                    "[document attachment omitted: {} ({}), {} bytes]",
                    name,
                    format,
                    data.len()
                ),
            },
            Self::ToolResult {
                tool_use_id,
                status,
                content,
            } => Self::ToolResult {
                tool_use_id,
                status,
                content: content.into_iter().map(Self::sanitized).collect(),
            },
            other => other,
        }
    }
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message ID
    pub id: String,

    /// Role of the message sender
    pub role: MessageRole,

    /// Message content
    pub content: Vec<ContentBlock>,

    /// Timestamp in milliseconds
    pub timestamp: i64,
}

impl ChatMessage {
    /// Create a message from content blocks
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Create a new user message
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![ContentBlock::text(text)])
    }

    /// Create a new assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, vec![ContentBlock::text(text)])
    }

    /// Create a new system message
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, vec![ContentBlock::text(text)])
    }

    /// Concatenated text of all text blocks
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_binary(&self) -> bool {
        self.content.iter().any(ContentBlock::has_binary)
    }

    /// Copy of this message that is safe to keep in long-lived history
    pub fn sanitized(self) -> Self {
        if !self.has_binary() {
            return self;
        }
        Self {
            content: self
                .content
                .into_iter()
                .map(ContentBlock::sanitized)
                .collect(),
            ..self
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_message_is_unchanged() {
        let message = ChatMessage::user("hello\nworld ✓");
        let sanitized = message.clone().sanitized();
        assert_eq!(sanitized, message);
    }

    #[test]
    fn test_image_replaced_with_placeholder() {
        let message = ChatMessage::new(
            MessageRole::User,
            vec![
                ContentBlock::text("look at this"),
                ContentBlock::Image {
                    format: "png".to_string(),
                    data: vec![0u8; 2048],
                },
            ],
        );

        let sanitized = message.clone().sanitized();
        assert_eq!(sanitized.id, message.id);
        assert!(!sanitized.has_binary());
        assert_eq!(
            sanitized.content[1],
            ContentBlock::text("[image attachment omitted: png, 2048 bytes]")
        );
    }

    #[test]
    fn test_tool_result_shape_preserved() {
        let message = ChatMessage::new(
            MessageRole::User,
            vec![
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "screenshot".to_string(),
                    input: serde_json::json!({"url": "https://example.com"}),
                },
                ContentBlock::ToolResult {
                    tool_use_id: "t1".to_string(),
                    status: ToolStatus::Success,
                    content: vec![
                        ContentBlock::text("captured"),
                        ContentBlock::Document {
                            name: "page".to_string(),
                            format: "pdf".to_string(),
                            data: vec![1, 2, 3],
                        },
                    ],
                },
            ],
        );

        let sanitized = message.sanitized();
        assert!(matches!(sanitized.content[0], ContentBlock::ToolUse { .. }));
        match &sanitized.content[1] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                assert_eq!(tool_use_id, "t1");
                assert_eq!(content[0], ContentBlock::text("captured"));
                assert_eq!(
                    content[1],
                    ContentBlock::text("[document attachment omitted: page (pdf), 3 bytes]")
                );
            }
            other => panic!("Expected ToolResult, got {:?}", other),
        }
    }

    #[test]
    fn test_binary_serializes_as_base64() {
        let block = ContentBlock::Image {
            format: "png".to_string(),
            data: b"abc".to_vec(),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["data"], "YWJj");

        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }

    #[tokio::test]
    async fn test_attachment_from_path() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dir = temp_dir.path();
        let image = dir.join("photo.JPG");
        let doc = dir.join("notes.md");
        tokio::fs::write(&image, [0xff, 0xd8]).await.unwrap();
        tokio::fs::write(&doc, "# notes").await.unwrap();

        let block = ContentBlock::from_path(&image).await.unwrap();
        assert!(matches!(block, ContentBlock::Image { ref format, .. } if format == "jpeg"));

        let block = ContentBlock::from_path(&doc).await.unwrap();
        match block {
            ContentBlock::Document { name, format, data } => {
                assert_eq!(name, "notes");
                assert_eq!(format, "md");
                assert_eq!(data, b"# notes");
            }
            other => panic!("Expected Document, got {:?}", other),
        }

        assert!(ContentBlock::from_path(dir.join("missing.png")).await.is_err());
    }
}
