use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::{MarkupParser, Segment};

const OPEN: &str = "<tool_call>";
const CLOSE: &str = "</tool_call>";

/// Parser for `<tool_call>{"name": .., "arguments": ..}</tool_call>` blocks
#[derive(Debug, Default)]
pub struct ToolCallParser {
    buffer: String,
}

impl ToolCallParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of the longest suffix of the buffer that could begin `OPEN`
    fn partial_open_len(&self) -> usize {
        (1..OPEN.len())
            .rev()
            .find(|&n| self.buffer.ends_with(&OPEN[..n]))
            .unwrap_or(0)
    }
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Segment::Text(previous)) = segments.last_mut() {
        previous.push_str(text);
    } else {
        segments.push(Segment::Text(text.to_string()));
    }
}

fn parse_call(body: &str) -> Option<Segment> {
    let value: Value = serde_json::from_str(body.trim()).ok()?;
    let name = value.get("name")?.as_str()?.to_string();
    let input = value
        .get("arguments")
        .or_else(|| value.get("input"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    // some models send the arguments as a JSON string
    let input = match input {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    };
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
    Some(Segment::ToolCall { id, name, input })
}

impl MarkupParser for ToolCallParser {
    fn feed(&mut self, chunk: &str) -> Vec<Segment> {
        self.buffer.push_str(chunk);
        let mut segments = Vec::new();

        loop {
            let Some(start) = self.buffer.find(OPEN) else {
                let keep = self.partial_open_len();
                let emit_to = self.buffer.len() - keep;
                let text: String = self.buffer.drain(..emit_to).collect();
                push_text(&mut segments, &text);
                break;
            };

            let before: String = self.buffer.drain(..start).collect();
            push_text(&mut segments, &before);

            let Some(end) = self.buffer[OPEN.len()..].find(CLOSE) else {
                // wait for the closing tag
                break;
            };
            let body_end = OPEN.len() + end;
            let body = self.buffer[OPEN.len()..body_end].to_string();
            self.buffer.drain(..body_end + CLOSE.len());

            match parse_call(&body) {
                Some(call) => segments.push(call),
                None => warn!("Dropping malformed tool call markup: {}", body.trim()),
            }
        }
        segments
    }

    fn finish(&mut self) -> Vec<Segment> {
        let mut segments = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        push_text(&mut segments, &rest);
        segments
    }
}
