//! Turning agent content into event payloads

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use hub_core::event::{MediaAttachment, MediaKind};
use hub_core::message::{ChatMessage, ContentBlock};

/// Binary media in a final message, base64-encoded for the client
pub fn extract_media(message: &ChatMessage) -> Vec<MediaAttachment> {
    let mut media = Vec::new();
    collect_media(&message.content, &mut media);
    media
}

fn collect_media(blocks: &[ContentBlock], media: &mut Vec<MediaAttachment>) {
    for block in blocks {
        match block {
            ContentBlock::Image { format, data } => media.push(MediaAttachment {
                kind: MediaKind::Image,
                format: format.clone(),
                name: None,
                data: STANDARD.encode(data),
            }),
            ContentBlock::Document { name, format, data } => media.push(MediaAttachment {
                kind: MediaKind::Document,
                format: format.clone(),
                name: Some(name.clone()),
                data: STANDARD.encode(data),
            }),
            ContentBlock::ToolResult { content, .. } => collect_media(content, media),
            ContentBlock::Text { .. } | ContentBlock::ToolUse { .. } => {}
        }
    }
}

/// Readable text for a tool result; binary payloads become placeholders
pub fn render_tool_output(content: &[ContentBlock]) -> String {
    content
        .iter()
        .cloned()
        .map(|block| match block.sanitized() {
            ContentBlock::Text { text } => text,
            ContentBlock::ToolResult { content, .. } => render_tool_output(&content),
            other => serde_json::to_string(&other).unwrap_or_default(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
