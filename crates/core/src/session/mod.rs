//! Session state: conversation history, tool/model configuration and the
//! dirty flags that tell the orchestrator when to rebuild a session's agent.

mod config;
mod state;

pub use config::{
    ConfigRejected, ModelConfig, ModelConfigUpdate, SystemPrompt, ToolConfig,
    ToolServerDescriptor, TransportConfig,
};
pub use state::{ConfigChanges, SessionState};
