//! Test doubles shared by the unit tests

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use hub_core::context::ExecutionContextRegistry;
use hub_core::message::ContentBlock;
use hub_core::session::ToolServerDescriptor;

use crate::agent::{AgentTurn, ModelBackend, PrimaryEvents, Tool, ToolOutput, ToolSpec};
use crate::error::PoolError;
use crate::event::AgentEvent;
use crate::pool::{ToolServerClient, ToolTransport};
use crate::progress::{ProgressHub, ProgressUpdate};

/// One step of a scripted turn, executed lazily as the stream is polled
#[derive(Debug, Clone)]
pub enum Step {
    Event(AgentEvent),
    Fail(String),
    /// Call a turn tool and yield its result
    CallTool {
        id: String,
        name: String,
        input: Value,
    },
    Publish(ProgressUpdate),
    Sleep(Duration),
    Hang,
}

/// What the backend saw for one turn
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub session_id: String,
    pub prompt: String,
    pub attachments: usize,
    pub history_len: usize,
    pub system_prompt: Option<String>,
    pub tools: Vec<String>,
    pub model_id: String,
}

pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    default_reply: String,
    fail_invoke: bool,
    progress: Option<Arc<ProgressHub>>,
    turns: Mutex<Vec<TurnRecord>>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::replying("ok")
    }

    /// Answer every unscripted turn with `text`
    pub fn replying(text: &str) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            default_reply: text.to_string(),
            fail_invoke: false,
            progress: None,
            turns: Mutex::new(Vec::new()),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a script for the next turn
    pub fn with_script(self, steps: Vec<Step>) -> Self {
        self.scripts.lock().unwrap().push_back(steps);
        self
    }

    pub fn with_progress(mut self, hub: Arc<ProgressHub>) -> Self {
        self.progress = Some(hub);
        self
    }

    pub fn failing_invoke(mut self) -> Self {
        self.fail_invoke = true;
        self
    }

    pub fn turns(&self) -> Vec<TurnRecord> {
        self.turns.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct ScriptState {
    steps: VecDeque<Step>,
    turn: AgentTurn,
    progress: Option<Arc<ProgressHub>>,
}

async fn run_tool(turn: &AgentTurn, id: String, name: &str, input: Value) -> AgentEvent {
    let output = match turn.tool(name) {
        Some(tool) => tool
            .call(&id, input)
            .await
            .unwrap_or_else(|e| ToolOutput::error(e.to_string())),
        None => ToolOutput::error(format!("unknown tool {}", name)),
    };
    AgentEvent::ToolResult {
        tool_use_id: id,
        status: output.status,
        content: output.content,
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn invoke(&self, turn: AgentTurn) -> anyhow::Result<PrimaryEvents> {
        if self.fail_invoke {
            return Err(anyhow!("backend unavailable"));
        }
        self.turns.lock().unwrap().push(TurnRecord {
            session_id: turn.session_id.clone(),
            prompt: turn.prompt.clone(),
            attachments: turn.attachments.len(),
            history_len: turn.history.len(),
            system_prompt: turn.system_prompt.clone(),
            tools: turn.tools.iter().map(|t| t.spec().name.clone()).collect(),
            model_id: turn.model.model_id.clone(),
        });

        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![Step::Event(AgentEvent::final_text(&self.default_reply))]);
        let state = ScriptState {
            steps: steps.into(),
            turn,
            progress: self.progress.clone(),
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                let step = state.steps.pop_front()?;
                let item = match step {
                    Step::Event(event) => Ok(event),
                    Step::Fail(message) => Err(anyhow!(message)),
                    Step::CallTool { id, name, input } => {
                        Ok(run_tool(&state.turn, id, &name, input).await)
                    }
                    Step::Publish(update) => {
                        if let Some(hub) = &state.progress {
                            hub.publish(&state.turn.session_id, update);
                        }
                        continue;
                    }
                    Step::Sleep(duration) => {
                        tokio::time::sleep(duration).await;
                        continue;
                    }
                    Step::Hang => {
                        futures::future::pending::<()>().await;
                        continue;
                    }
                };
                return Some((item, state));
            }
        });

        let closes = Arc::clone(&self.closes);
        Ok(PrimaryEvents::new(stream.boxed()).with_close_hook(move || {
            closes.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Tool answering `"{session}:{input}"`, where session is taken from the
/// current execution context
pub struct EchoTool {
    spec: ToolSpec,
    progress: Option<Arc<ProgressHub>>,
}

impl EchoTool {
    pub fn new(name: &str) -> Self {
        Self {
            spec: ToolSpec {
                name: name.to_string(),
                description: "Echo the input".to_string(),
                input_schema: json!({"type": "object"}),
            },
            progress: None,
        }
    }

    /// Publish one progress update per call
    pub fn with_progress(mut self, hub: Arc<ProgressHub>) -> Self {
        self.progress = Some(hub);
        self
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, _invocation_id: &str, input: Value) -> anyhow::Result<ToolOutput> {
        if let Some(hub) = &self.progress {
            hub.publish_current("working", None);
        }
        let session = ExecutionContextRegistry::current()
            .map(|c| c.session_id)
            .unwrap_or_else(|| "none".to_string());
        Ok(ToolOutput::success(format!("{}:{}", session, input)))
    }
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    list_calls: AtomicUsize,
    calls: AtomicUsize,
    closes: AtomicUsize,
}

/// Shared counters of a fake transport and its clients
#[derive(Debug, Clone, Default)]
pub struct FakeTransportLog {
    counters: Arc<Counters>,
}

impl FakeTransportLog {
    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.counters.list_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

/// Client exposing one tool named after the server
pub struct FakeClient {
    server_id: String,
    destination: String,
    log: FakeTransportLog,
    call_delay: Duration,
    broken_catalog: bool,
}

impl FakeClient {
    pub fn new(descriptor: &ToolServerDescriptor, log: FakeTransportLog) -> Self {
        Self {
            server_id: descriptor.id.clone(),
            destination: descriptor.transport.destination().to_string(),
            log,
            call_delay: Duration::ZERO,
            broken_catalog: false,
        }
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }
}

#[async_trait]
impl ToolServerClient for FakeClient {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, PoolError> {
        self.log.counters.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken_catalog {
            return Err(PoolError::InvalidResponse("tools/list failed".to_string()));
        }
        Ok(vec![ToolSpec {
            name: self.server_id.clone(),
            description: format!("Tool served by {}", self.destination),
            input_schema: json!({"type": "object"}),
        }])
    }

    async fn call_tool(&self, _name: &str, input: Value) -> Result<ToolOutput, PoolError> {
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        self.log.counters.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput {
            status: hub_core::message::ToolStatus::Success,
            content: vec![ContentBlock::text(format!(
                "{}@{}:{}",
                self.server_id, self.destination, input
            ))],
        })
    }

    async fn close(&self) {
        self.log.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeTransport {
    pub log: FakeTransportLog,
    failing: HashSet<String>,
    broken_catalog: HashSet<String>,
}

impl FakeTransport {
    /// Transport that refuses to connect to the given destinations
    pub fn failing(destinations: &[&str]) -> Self {
        Self {
            log: FakeTransportLog::default(),
            failing: destinations.iter().map(|d| d.to_string()).collect(),
            broken_catalog: HashSet::new(),
        }
    }

    /// Transport whose connections to the given destinations cannot list tools
    pub fn broken_catalog(destinations: &[&str]) -> Self {
        Self {
            broken_catalog: destinations.iter().map(|d| d.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ToolTransport for FakeTransport {
    async fn connect(
        &self,
        descriptor: &ToolServerDescriptor,
    ) -> Result<Arc<dyn ToolServerClient>, PoolError> {
        let destination = descriptor.transport.destination();
        if self.failing.contains(destination) {
            return Err(PoolError::connect(&descriptor.id, "connection refused"));
        }
        self.log.counters.connects.fetch_add(1, Ordering::SeqCst);
        let mut client = FakeClient::new(descriptor, self.log.clone());
        client.broken_catalog = self.broken_catalog.contains(destination);
        Ok(Arc::new(client))
    }
}
