//! Canonical streaming events
//!
//! Every run produces a sequence of [`StreamEvent`]s. The transport layer
//! frames them (see [`StreamEvent::to_sse_frame`]) but never inspects the
//! agent's raw output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::ToolStatus;

/// Lifecycle phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    /// First event of every run
    Init,
    /// The agent is setting itself up
    Initializing,
    /// The agent started reasoning about the next step
    Thinking,
    /// Nothing happened for a while; the run is still alive
    Keepalive,
}

/// Kind of media attached to a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Document,
}

/// Media extracted from a final result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Base64-encoded payload
    pub data: String,
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Lifecycle {
        phase: LifecyclePhase,
    },

    Reasoning {
        text: String,
    },

    ResponseText {
        text: String,
    },

    ToolInvocation {
        invocation_id: String,
        tool_name: String,
        input: Value,
    },

    ToolResult {
        invocation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        status: ToolStatus,
        output: String,
    },

    Progress {
        #[serde(skip_serializing_if = "Option::is_none")]
        invocation_id: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        percentage: Option<f32>,
    },

    Complete {
        stop_reason: String,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        media: Vec<MediaAttachment>,
    },

    Error {
        message: String,
    },
}

/// Streaming event with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Session ID this event belongs to
    pub session_id: String,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// The event payload
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StreamEvent {
    /// Create a new streaming event
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn lifecycle(session_id: impl Into<String>, phase: LifecyclePhase) -> Self {
        Self::new(session_id, EventPayload::Lifecycle { phase })
    }

    pub fn reasoning(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(session_id, EventPayload::Reasoning { text: text.into() })
    }

    pub fn response_text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(session_id, EventPayload::ResponseText { text: text.into() })
    }

    pub fn tool_invocation(
        session_id: impl Into<String>,
        invocation_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self::new(
            session_id,
            EventPayload::ToolInvocation {
                invocation_id: invocation_id.into(),
                tool_name: tool_name.into(),
                input,
            },
        )
    }

    pub fn tool_result(
        session_id: impl Into<String>,
        invocation_id: impl Into<String>,
        tool_name: Option<String>,
        status: ToolStatus,
        output: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            EventPayload::ToolResult {
                invocation_id: invocation_id.into(),
                tool_name,
                status,
                output: output.into(),
            },
        )
    }

    pub fn progress(
        session_id: impl Into<String>,
        invocation_id: Option<String>,
        message: impl Into<String>,
        percentage: Option<f32>,
    ) -> Self {
        Self::new(
            session_id,
            EventPayload::Progress {
                invocation_id,
                message: message.into(),
                percentage,
            },
        )
    }

    pub fn complete(
        session_id: impl Into<String>,
        stop_reason: impl Into<String>,
        text: impl Into<String>,
        media: Vec<MediaAttachment>,
    ) -> Self {
        Self::new(
            session_id,
            EventPayload::Complete {
                stop_reason: stop_reason.into(),
                text: text.into(),
                media,
            },
        )
    }

    pub fn error(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            session_id,
            EventPayload::Error {
                message: message.into(),
            },
        )
    }

    /// Short name of the event kind, matching the serialized `type` tag
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            EventPayload::Lifecycle { .. } => "lifecycle",
            EventPayload::Reasoning { .. } => "reasoning",
            EventPayload::ResponseText { .. } => "response_text",
            EventPayload::ToolInvocation { .. } => "tool_invocation",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::Progress { .. } => "progress",
            EventPayload::Complete { .. } => "complete",
            EventPayload::Error { .. } => "error",
        }
    }

    /// Invocation this event refers to, if any
    pub fn invocation_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::ToolInvocation { invocation_id, .. }
            | EventPayload::ToolResult { invocation_id, .. } => Some(invocation_id),
            EventPayload::Progress { invocation_id, .. } => invocation_id.as_deref(),
            _ => None,
        }
    }

    /// Check if the event ends a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::Complete { .. } | EventPayload::Error { .. }
        )
    }

    /// Frame the event as a Server-Sent Events message
    pub fn to_sse_frame(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("event: {}\ndata: {}\n\n", self.kind(), json),
            Err(e) => {
                tracing::error!("Failed to serialize stream event: {}", e);
                format!("event: error\ndata: {{\"type\":\"error\",\"message\":\"{}\"}}\n\n", e)
            }
        }
    }
}
