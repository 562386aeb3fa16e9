//! Per-session state store

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use super::config::{
    ConfigRejected, ModelConfig, ModelConfigUpdate, SystemPrompt, ToolConfig, ToolServerDescriptor,
};
use crate::message::ChatMessage;

/// Which parts of the configuration changed since the agent was last built
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfigChanges {
    pub tools: bool,
    pub model: bool,
}

impl ConfigChanges {
    pub fn any(&self) -> bool {
        self.tools || self.model
    }
}

#[derive(Debug)]
struct SessionData {
    last_activity: DateTime<Utc>,
    messages: Vec<ChatMessage>,
    tool_config: ToolConfig,
    model_config: ModelConfig,
    changes: ConfigChanges,
}

/// State of one session: history, configuration and dirty flags.
///
/// All fields sit behind a single lock, so multi-field updates and the
/// flag reset are atomic.
#[derive(Debug)]
pub struct SessionState {
    id: String,
    created_at: DateTime<Utc>,
    data: RwLock<SessionData>,
}

impl SessionState {
    pub fn new(id: impl Into<String>, model_config: ModelConfig, tool_config: ToolConfig) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            data: RwLock::new(SessionData {
                last_activity: now,
                messages: Vec::new(),
                tool_config,
                model_config,
                changes: ConfigChanges::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        self.data.read().await.last_activity
    }

    pub async fn touch(&self) {
        self.touch_at(Utc::now()).await;
    }

    /// Record activity at a specific instant
    pub async fn touch_at(&self, at: DateTime<Utc>) {
        self.data.write().await.last_activity = at;
    }

    /// Append a message, stripping binary payloads. Returns the stored copy.
    pub async fn append_message(&self, message: ChatMessage) -> ChatMessage {
        let stored = message.sanitized();
        let mut data = self.data.write().await;
        data.messages.push(stored.clone());
        data.last_activity = Utc::now();
        stored
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.data.read().await.messages.clone()
    }

    pub async fn message_count(&self) -> usize {
        self.data.read().await.messages.len()
    }

    /// Drop the history, keeping configuration
    pub async fn clear_history(&self) {
        let mut data = self.data.write().await;
        data.messages.clear();
        data.last_activity = Utc::now();
    }

    pub async fn tool_config(&self) -> ToolConfig {
        self.data.read().await.tool_config.clone()
    }

    pub async fn enabled_tools(&self) -> Vec<ToolServerDescriptor> {
        self.data.read().await.tool_config.enabled()
    }

    /// Replace the declared tool servers
    pub async fn set_tool_servers(
        &self,
        servers: Vec<ToolServerDescriptor>,
    ) -> Result<ToolConfig, ConfigRejected> {
        let config = ToolConfig::from_servers(servers)?;
        let mut data = self.data.write().await;
        data.tool_config = config.clone();
        data.changes.tools = true;
        data.last_activity = Utc::now();
        Ok(config)
    }

    /// Add or replace a single tool server
    pub async fn upsert_tool_server(
        &self,
        server: ToolServerDescriptor,
    ) -> Result<ToolConfig, ConfigRejected> {
        if server.id.trim().is_empty() {
            return Err(ConfigRejected::Invalid("tool server id is empty".to_string()));
        }
        let mut data = self.data.write().await;
        data.tool_config.servers.insert(server.id.clone(), server);
        data.changes.tools = true;
        data.last_activity = Utc::now();
        Ok(data.tool_config.clone())
    }

    pub async fn remove_tool_server(&self, id: &str) -> Result<ToolConfig, ConfigRejected> {
        let mut data = self.data.write().await;
        if data.tool_config.servers.remove(id).is_none() {
            return Err(ConfigRejected::UnknownToolServer(id.to_string()));
        }
        data.changes.tools = true;
        data.last_activity = Utc::now();
        Ok(data.tool_config.clone())
    }

    pub async fn set_tool_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<ToolConfig, ConfigRejected> {
        let mut guard = self.data.write().await;
        let data = &mut *guard;
        let server = data
            .tool_config
            .servers
            .get_mut(id)
            .ok_or_else(|| ConfigRejected::UnknownToolServer(id.to_string()))?;
        if server.enabled != enabled {
            server.enabled = enabled;
            data.changes.tools = true;
        }
        data.last_activity = Utc::now();
        Ok(data.tool_config.clone())
    }

    pub async fn model_config(&self) -> ModelConfig {
        self.data.read().await.model_config.clone()
    }

    pub async fn update_model_config(
        &self,
        update: ModelConfigUpdate,
    ) -> Result<ModelConfig, ConfigRejected> {
        let mut data = self.data.write().await;
        data.model_config.apply(update)?;
        data.changes.model = true;
        data.last_activity = Utc::now();
        Ok(data.model_config.clone())
    }

    pub async fn active_system_prompt(&self) -> Option<SystemPrompt> {
        self.data.read().await.model_config.active_prompt().cloned()
    }

    pub async fn add_system_prompt(&self, name: &str, text: &str, activate: bool) -> SystemPrompt {
        let mut data = self.data.write().await;
        let prompt = data.model_config.add_prompt(name, text, activate);
        if prompt.active {
            data.changes.model = true;
        }
        data.last_activity = Utc::now();
        prompt
    }

    pub async fn activate_system_prompt(&self, id: &str) -> Result<ModelConfig, ConfigRejected> {
        let mut data = self.data.write().await;
        data.model_config.activate_prompt(id)?;
        data.changes.model = true;
        data.last_activity = Utc::now();
        Ok(data.model_config.clone())
    }

    pub async fn update_system_prompt(
        &self,
        id: &str,
        name: Option<String>,
        text: Option<String>,
    ) -> Result<ModelConfig, ConfigRejected> {
        let mut data = self.data.write().await;
        if data.model_config.update_prompt(id, name, text)? {
            data.changes.model = true;
        }
        data.last_activity = Utc::now();
        Ok(data.model_config.clone())
    }

    pub async fn delete_system_prompt(&self, id: &str) -> Result<ModelConfig, ConfigRejected> {
        let mut data = self.data.write().await;
        if data.model_config.delete_prompt(id)? {
            data.changes.model = true;
        }
        data.last_activity = Utc::now();
        Ok(data.model_config.clone())
    }

    pub async fn config_changes(&self) -> ConfigChanges {
        self.data.read().await.changes
    }

    /// Whether the bound agent must be rebuilt before its next use
    pub async fn has_config_changes(&self) -> bool {
        self.data.read().await.changes.any()
    }

    pub async fn reset_config_change_flags(&self) {
        self.data.write().await.changes = ConfigChanges::default();
    }

    /// Rough size of the session in memory, in bytes
    pub async fn approx_memory_bytes(&self) -> usize {
        let data = self.data.read().await;
        let messages: usize = data
            .messages
            .iter()
            .map(|m| serde_json::to_vec(m).map(|v| v.len()).unwrap_or(0))
            .sum();
        let config = serde_json::to_vec(&data.tool_config).map(|v| v.len()).unwrap_or(0)
            + serde_json::to_vec(&data.model_config).map(|v| v.len()).unwrap_or(0);
        messages + config
    }
}
