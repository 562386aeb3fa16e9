//! Events produced by the model backend
//!
//! These are the raw, backend-shaped events a run consumes. The multiplexer
//! turns them into canonical [`hub_core::event::StreamEvent`]s.

use serde::{Deserialize, Serialize};

use hub_core::message::{ChatMessage, ContentBlock, ToolStatus};

/// Lifecycle markers the backend emits around its event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleMarker {
    /// Backend is initializing the turn
    Init,
    /// Backend started processing
    Start,
    /// A new reasoning cycle of the event loop started
    StartEventLoop,
}

/// Events emitted by the agent during a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Lifecycle marker
    Lifecycle { marker: LifecycleMarker },

    /// Chunk of reasoning text
    ReasoningDelta { text: String },

    /// Chunk of response text; may contain raw `<tool_call>` markup
    TextDelta { text: String },

    /// Tool invocation being assembled. `input` is the cumulative JSON
    /// argument text so far and may not parse yet.
    ToolUse {
        id: String,
        name: String,
        input: String,
    },

    /// Result of a tool invocation
    ToolResult {
        tool_use_id: String,
        status: ToolStatus,
        content: Vec<ContentBlock>,
    },

    /// Final assistant message; ends the turn
    Final {
        message: ChatMessage,
        stop_reason: String,
    },
}

impl AgentEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: impl Into<String>) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input: input.into(),
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, status: ToolStatus, output: &str) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            status,
            content: vec![ContentBlock::text(output)],
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self::Final {
            message: ChatMessage::assistant(text),
            stop_reason: "end_turn".to_string(),
        }
    }
}
