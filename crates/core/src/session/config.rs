//! Tool and model configuration carried by a session

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Why a configuration change was not applied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigRejected {
    #[error("Session not found: {0}")]
    UnknownSession(String),

    #[error("Tool server not found: {0}")]
    UnknownToolServer(String),

    #[error("System prompt not found: {0}")]
    UnknownPrompt(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How to reach a tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Child process speaking JSON-RPC over stdin/stdout
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// JSON-RPC over HTTP POST
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    /// Where the transport points to, for logs
    pub fn destination(&self) -> &str {
        match self {
            Self::Stdio { command, .. } => command,
            Self::Http { url, .. } => url,
        }
    }
}

/// A declared tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Stateless servers get one connection shared by every session
    #[serde(default)]
    pub stateless: bool,
    pub transport: TransportConfig,
    /// Free-form server configuration
    #[serde(default)]
    pub config: Value,
}

fn default_true() -> bool {
    true
}

impl ToolServerDescriptor {
    pub fn new(id: impl Into<String>, transport: TransportConfig) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            stateless: false,
            transport,
            config: Value::Null,
        }
    }

    pub fn stateless(mut self) -> Self {
        self.stateless = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Tool configuration of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub servers: BTreeMap<String, ToolServerDescriptor>,
}

impl ToolConfig {
    /// Build from a list, rejecting empty or duplicate IDs
    pub fn from_servers(servers: Vec<ToolServerDescriptor>) -> Result<Self, ConfigRejected> {
        let mut map = BTreeMap::new();
        for server in servers {
            if server.id.trim().is_empty() {
                return Err(ConfigRejected::Invalid("tool server id is empty".to_string()));
            }
            let id = server.id.clone();
            if map.insert(id.clone(), server).is_some() {
                return Err(ConfigRejected::Invalid(format!(
                    "duplicate tool server id: {}",
                    id
                )));
            }
        }
        Ok(Self { servers: map })
    }

    pub fn enabled(&self) -> Vec<ToolServerDescriptor> {
        self.servers.values().filter(|s| s.enabled).cloned().collect()
    }
}

/// A named system prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub id: String,
    pub name: String,
    pub text: String,
    pub active: bool,
}

/// Model configuration of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub temperature: f32,
    pub caching: bool,
    #[serde(default)]
    pub system_prompts: Vec<SystemPrompt>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "default".to_string(),
            temperature: 0.7,
            caching: false,
            system_prompts: Vec::new(),
        }
    }
}

/// Partial update of the scalar model settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigUpdate {
    pub model_id: Option<String>,
    pub temperature: Option<f32>,
    pub caching: Option<bool>,
}

impl ModelConfig {
    /// Apply an update; nothing changes unless every field is valid
    pub fn apply(&mut self, update: ModelConfigUpdate) -> Result<(), ConfigRejected> {
        if let Some(model_id) = &update.model_id {
            if model_id.trim().is_empty() {
                return Err(ConfigRejected::Invalid("model id is empty".to_string()));
            }
        }
        if let Some(temperature) = update.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                return Err(ConfigRejected::Invalid(format!(
                    "temperature {} is outside 0.0..=1.0",
                    temperature
                )));
            }
        }

        if let Some(model_id) = update.model_id {
            self.model_id = model_id;
        }
        if let Some(temperature) = update.temperature {
            self.temperature = temperature;
        }
        if let Some(caching) = update.caching {
            self.caching = caching;
        }
        Ok(())
    }

    pub fn active_prompt(&self) -> Option<&SystemPrompt> {
        self.system_prompts.iter().find(|p| p.active)
    }

    /// Add a prompt. The first prompt is always activated.
    pub fn add_prompt(&mut self, name: &str, text: &str, activate: bool) -> SystemPrompt {
        let activate = activate || self.system_prompts.is_empty();
        if activate {
            for prompt in &mut self.system_prompts {
                prompt.active = false;
            }
        }
        let prompt = SystemPrompt {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            text: text.to_string(),
            active: activate,
        };
        self.system_prompts.push(prompt.clone());
        prompt
    }

    pub fn activate_prompt(&mut self, id: &str) -> Result<(), ConfigRejected> {
        if !self.system_prompts.iter().any(|p| p.id == id) {
            return Err(ConfigRejected::UnknownPrompt(id.to_string()));
        }
        for prompt in &mut self.system_prompts {
            prompt.active = prompt.id == id;
        }
        Ok(())
    }

    /// Edit a prompt's name and/or text. Returns whether the prompt is active.
    pub fn update_prompt(
        &mut self,
        id: &str,
        name: Option<String>,
        text: Option<String>,
    ) -> Result<bool, ConfigRejected> {
        let prompt = self
            .system_prompts
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ConfigRejected::UnknownPrompt(id.to_string()))?;
        if let Some(name) = name {
            prompt.name = name;
        }
        if let Some(text) = text {
            prompt.text = text;
        }
        Ok(prompt.active)
    }

    /// Delete a prompt, promoting the first remaining one if it was active.
    /// Returns whether the deleted prompt was active.
    pub fn delete_prompt(&mut self, id: &str) -> Result<bool, ConfigRejected> {
        let index = self
            .system_prompts
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| ConfigRejected::UnknownPrompt(id.to_string()))?;
        let removed = self.system_prompts.remove(index);
        if removed.active {
            if let Some(first) = self.system_prompts.first_mut() {
                first.active = true;
            }
        }
        Ok(removed.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_count(config: &ModelConfig) -> usize {
        config.system_prompts.iter().filter(|p| p.active).count()
    }

    #[test]
    fn test_first_prompt_is_active() {
        let mut config = ModelConfig::default();
        let first = config.add_prompt("default", "You are helpful.", false);
        assert!(first.active);

        let second = config.add_prompt("terse", "Be brief.", false);
        assert!(!second.active);
        assert_eq!(config.active_prompt().unwrap().id, first.id);
    }

    #[test]
    fn test_exactly_one_active_after_any_sequence() {
        let mut config = ModelConfig::default();
        let a = config.add_prompt("a", "A", false);
        let b = config.add_prompt("b", "B", true);
        let c = config.add_prompt("c", "C", false);
        assert_eq!(active_count(&config), 1);
        assert_eq!(config.active_prompt().unwrap().id, b.id);

        config.activate_prompt(&c.id).unwrap();
        assert_eq!(active_count(&config), 1);

        // deleting the active prompt promotes exactly one of the rest
        assert!(config.delete_prompt(&c.id).unwrap());
        assert_eq!(active_count(&config), 1);
        assert_eq!(config.active_prompt().unwrap().id, a.id);

        assert!(!config.delete_prompt(&b.id).unwrap());
        assert_eq!(active_count(&config), 1);

        assert!(config.delete_prompt(&a.id).unwrap());
        assert!(config.system_prompts.is_empty());
        assert!(config.active_prompt().is_none());
    }

    #[test]
    fn test_unknown_prompt_rejected() {
        let mut config = ModelConfig::default();
        assert_eq!(
            config.activate_prompt("nope"),
            Err(ConfigRejected::UnknownPrompt("nope".to_string()))
        );
        assert!(config.delete_prompt("nope").is_err());
        assert!(config.update_prompt("nope", None, None).is_err());
    }

    #[test]
    fn test_update_is_all_or_nothing() {
        let mut config = ModelConfig::default();
        let before = config.clone();

        let result = config.apply(ModelConfigUpdate {
            model_id: Some("claude".to_string()),
            temperature: Some(3.0),
            caching: Some(true),
        });
        assert!(matches!(result, Err(ConfigRejected::Invalid(_))));
        assert_eq!(config, before);

        config
            .apply(ModelConfigUpdate {
                model_id: Some("claude".to_string()),
                temperature: Some(0.2),
                caching: None,
            })
            .unwrap();
        assert_eq!(config.model_id, "claude");
        assert_eq!(config.temperature, 0.2);
        assert!(!config.caching);
    }

    #[test]
    fn test_tool_config_rejects_duplicates() {
        let transport = TransportConfig::Http {
            url: "http://localhost:9000".to_string(),
            headers: BTreeMap::new(),
        };
        let result = ToolConfig::from_servers(vec![
            ToolServerDescriptor::new("search", transport.clone()),
            ToolServerDescriptor::new("search", transport.clone()),
        ]);
        assert!(matches!(result, Err(ConfigRejected::Invalid(_))));

        let config = ToolConfig::from_servers(vec![
            ToolServerDescriptor::new("search", transport.clone()),
            ToolServerDescriptor::new("files", transport).disabled(),
        ])
        .unwrap();
        let enabled = config.enabled();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "search");
    }

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let descriptor: ToolServerDescriptor = serde_json::from_value(serde_json::json!({
            "id": "fs",
            "name": "Filesystem",
            "transport": {"kind": "stdio", "command": "fs-server"}
        }))
        .unwrap();
        assert!(descriptor.enabled);
        assert!(!descriptor.stateless);
        assert_eq!(descriptor.transport.destination(), "fs-server");
    }
}
