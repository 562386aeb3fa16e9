//! Parsers for tool calls embedded in response text

use serde_json::Value;

pub mod tool_call;

/// A piece of parsed response text
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Plain text, markup removed
    Text(String),
    /// A tool call written inline by the model
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
}

/// Trait for incremental markup parsers
pub trait MarkupParser: Send {
    /// Feed the next chunk of text.
    ///
    /// Text that might be the start of markup is held back until the next
    /// chunk shows what it is.
    fn feed(&mut self, chunk: &str) -> Vec<Segment>;

    /// Flush whatever is still buffered
    fn finish(&mut self) -> Vec<Segment>;
}

/// Create the parser for `<tool_call>` markup
pub fn create_parser() -> Box<dyn MarkupParser> {
    Box::new(tool_call::ToolCallParser::new())
}
