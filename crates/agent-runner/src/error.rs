//! Error types for agent-runner

use thiserror::Error;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Errors that can occur while orchestrating sessions and runs
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The same message is already streaming for this session
    #[error("An identical request is already streaming for session {session_id}")]
    DuplicateRun { session_id: String },

    /// Dedicated worker is gone
    #[error("Worker for session {session_id} is shut down")]
    WorkerClosed { session_id: String },

    /// A job on a dedicated worker panicked
    #[error("Worker job for session {session_id} panicked")]
    WorkerJobPanicked { session_id: String },

    /// Caller is not running inside a tool invocation
    #[error("No execution context is current")]
    NoCurrentContext,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors talking to tool servers
#[derive(Debug, Error)]
pub enum PoolError {
    /// Could not open a connection
    #[error("Failed to connect to tool server {server_id}: {message}")]
    Connect { server_id: String, message: String },

    /// The server answered with a JSON-RPC error
    #[error("Tool server {server_id} returned error {code}: {message}")]
    Rpc {
        server_id: String,
        code: i64,
        message: String,
    },

    /// The connection broke or timed out
    #[error("Transport error talking to {server_id}: {message}")]
    Transport { server_id: String, message: String },

    /// The connection was invalidated; resolve tools again
    #[error("Connection to tool server {server_id} was retired")]
    Retired { server_id: String },

    /// The server sent something that is not a valid response
    #[error("Invalid response from tool server: {0}")]
    InvalidResponse(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Create a Connect error
    pub fn connect(server_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            server_id: server_id.into(),
            message: message.into(),
        }
    }

    /// Create a Transport error
    pub fn transport(server_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            server_id: server_id.into(),
            message: message.into(),
        }
    }
}
