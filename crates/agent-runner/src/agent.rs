//! Agent abstraction
//!
//! The model backend is a black box: given the turn it returns a stream of
//! [`AgentEvent`]s. Tools are handed to it already bound to their session so
//! that every invocation runs inside an execution context.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use hub_core::context::ExecutionContextRegistry;
use hub_core::message::{ChatMessage, ContentBlock, MessageRole, ToolStatus};
use hub_core::session::ModelConfig;

use crate::event::AgentEvent;

/// Description of a callable tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// What a tool call produced
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub status: ToolStatus,
    pub content: Vec<ContentBlock>,
}

impl ToolOutput {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            content: vec![ContentBlock::text(text)],
        }
    }
}

/// A tool the agent can call
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    async fn call(&self, invocation_id: &str, input: Value) -> anyhow::Result<ToolOutput>;
}

/// Tool wrapper that runs every call inside an execution context bound to
/// its session
pub struct SessionBoundTool {
    inner: Arc<dyn Tool>,
    session_id: String,
    contexts: Arc<ExecutionContextRegistry>,
}

impl SessionBoundTool {
    pub fn new(
        inner: Arc<dyn Tool>,
        session_id: impl Into<String>,
        contexts: Arc<ExecutionContextRegistry>,
    ) -> Self {
        Self {
            inner,
            session_id: session_id.into(),
            contexts,
        }
    }
}

#[async_trait]
impl Tool for SessionBoundTool {
    fn spec(&self) -> &ToolSpec {
        self.inner.spec()
    }

    async fn call(&self, invocation_id: &str, input: Value) -> anyhow::Result<ToolOutput> {
        let name = self.inner.spec().name.clone();
        self.contexts
            .run_invocation(
                invocation_id,
                &name,
                Some(&self.session_id),
                self.inner.call(invocation_id, input),
            )
            .await
    }
}

/// Everything the backend needs for one turn
pub struct AgentTurn {
    pub session_id: String,
    pub prompt: String,
    pub attachments: Vec<ContentBlock>,
    pub system_prompt: Option<String>,
    pub model: ModelConfig,
    pub tools: Vec<Arc<dyn Tool>>,
    /// Conversation so far, excluding this turn's prompt
    pub history: Vec<ChatMessage>,
}

impl AgentTurn {
    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.spec().name == name).cloned()
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// The primary event stream of a turn.
///
/// Closing releases whatever the backend holds for the turn. It happens at
/// most once, either through [`close`](Self::close) or on drop.
pub struct PrimaryEvents {
    stream: BoxStream<'static, anyhow::Result<AgentEvent>>,
    on_close: Option<CloseHook>,
}

impl PrimaryEvents {
    pub fn new(stream: BoxStream<'static, anyhow::Result<AgentEvent>>) -> Self {
        Self {
            stream,
            on_close: None,
        }
    }

    /// Run `hook` when the stream is closed
    pub fn with_close_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub async fn next(&mut self) -> Option<anyhow::Result<AgentEvent>> {
        self.stream.next().await
    }

    pub fn close(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl Drop for PrimaryEvents {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PrimaryEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryEvents")
            .field("closed", &self.on_close.is_none())
            .finish()
    }
}

/// The model backend
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn invoke(&self, turn: AgentTurn) -> anyhow::Result<PrimaryEvents>;
}

/// A session's agent: backend plus the configuration it was built from
pub struct Agent {
    session_id: String,
    backend: Arc<dyn ModelBackend>,
    model: ModelConfig,
    tools: Vec<Arc<dyn Tool>>,
    history: Vec<ChatMessage>,
}

impl Agent {
    /// Build an agent; `tools` are bound to the session here
    pub fn new(
        session_id: impl Into<String>,
        backend: Arc<dyn ModelBackend>,
        model: ModelConfig,
        tools: Vec<Arc<dyn Tool>>,
        contexts: &Arc<ExecutionContextRegistry>,
    ) -> Self {
        let session_id = session_id.into();
        let tools = tools
            .into_iter()
            .map(|tool| {
                Arc::new(SessionBoundTool::new(tool, &session_id, Arc::clone(contexts)))
                    as Arc<dyn Tool>
            })
            .collect();
        Self {
            session_id,
            backend,
            model,
            tools,
            history: Vec::new(),
        }
    }

    /// Build a replacement agent from new configuration, carrying over the
    /// conversation history
    pub fn rebuild(
        &self,
        model: ModelConfig,
        tools: Vec<Arc<dyn Tool>>,
        contexts: &Arc<ExecutionContextRegistry>,
    ) -> Self {
        let mut agent = Self::new(
            self.session_id.clone(),
            Arc::clone(&self.backend),
            model,
            tools,
            contexts,
        );
        agent.history = self.history.clone();
        debug!(
            "Rebuilt agent for session {} with {} tools",
            self.session_id,
            agent.tools.len()
        );
        agent
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.spec().name.clone()).collect()
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn push_history(&mut self, message: ChatMessage) {
        self.history.push(message.sanitized());
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Start a turn. The prompt joins the history once the backend accepted it.
    pub async fn stream(
        &mut self,
        prompt: &str,
        attachments: Vec<ContentBlock>,
    ) -> anyhow::Result<PrimaryEvents> {
        let mut content = vec![ContentBlock::text(prompt)];
        content.extend(attachments.iter().cloned());
        let user_message = ChatMessage::new(MessageRole::User, content);

        let turn = AgentTurn {
            session_id: self.session_id.clone(),
            prompt: prompt.to_string(),
            attachments,
            system_prompt: self.model.active_prompt().map(|p| p.text.clone()),
            model: self.model.clone(),
            tools: self.tools.clone(),
            history: self.history.clone(),
        };

        let events = self.backend.invoke(turn).await?;
        self.push_history(user_message);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EchoTool, ScriptedBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_bound_tool_runs_in_session_context() {
        let contexts = Arc::new(ExecutionContextRegistry::new());
        let tool = SessionBoundTool::new(Arc::new(EchoTool::new("echo")), "s1", Arc::clone(&contexts));

        let output = tool.call("t1", serde_json::json!({"x": 1})).await.unwrap();
        // EchoTool reports the session it saw as current
        assert_eq!(output.content[0], ContentBlock::text("s1:{\"x\":1}"));
        assert_eq!(contexts.get("t1").await.unwrap().session_id, "s1");
    }

    #[tokio::test]
    async fn test_stream_records_prompt_and_passes_history() {
        let contexts = Arc::new(ExecutionContextRegistry::new());
        let backend = Arc::new(ScriptedBackend::replying("hi there"));
        let mut model = ModelConfig::default();
        model.add_prompt("default", "Be nice.", true);

        let mut agent = Agent::new(
            "s1",
            backend.clone(),
            model,
            vec![Arc::new(EchoTool::new("echo")) as Arc<dyn Tool>],
            &contexts,
        );
        agent.stream("hello", Vec::new()).await.unwrap();
        agent.push_history(ChatMessage::assistant("hi there"));
        agent.stream("again", Vec::new()).await.unwrap();

        let turns = backend.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].history_len, 0);
        assert_eq!(turns[1].history_len, 2);
        assert_eq!(turns[1].system_prompt.as_deref(), Some("Be nice."));
        assert_eq!(turns[1].tools, vec!["echo".to_string()]);
        assert_eq!(agent.history().len(), 3);
    }

    #[tokio::test]
    async fn test_primary_events_close_once() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let mut events = PrimaryEvents::new(futures::stream::empty().boxed())
            .with_close_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        assert!(events.next().await.is_none());
        events.close();
        events.close();
        drop(events);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
