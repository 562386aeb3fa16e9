//! Agent Runner - Multi-tenant agent orchestration
//!
//! This crate turns user messages into streamed agent runs:
//! - A session registry owning one agent per conversation
//! - A pool of tool-server connections shared across turns
//! - A multiplexer merging agent output and tool progress into one stream
//! - Per-session worker threads for blocking tool work

mod agent;
mod error;
mod event;
mod format;
mod hub;
mod multiplexer;
mod parser;
mod pool;
mod progress;
mod registry;
mod worker;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentTurn, ModelBackend, PrimaryEvents, Tool, ToolOutput, ToolSpec};
pub use error::{PoolError, Result, RunnerError};
pub use event::{AgentEvent, LifecycleMarker};
pub use format::{extract_media, render_tool_output};
pub use hub::{Hub, SweepReport};
pub use multiplexer::{message_hash, RunRequest, RunStream, StreamMultiplexer};
pub use parser::{create_parser, MarkupParser, Segment};
pub use pool::{
    fingerprint, ConnectionInfo, ConnectionKey, JsonRpcTransport, ToolConnectionPool,
    ToolServerClient, ToolTransport,
};
pub use progress::{ProgressHub, ProgressReceiver, ProgressUpdate};
pub use registry::{RegistryStats, SessionDefaults, SessionHandle, SessionRegistry, SessionSummary};
pub use worker::{SessionWorker, SessionWorkers};
