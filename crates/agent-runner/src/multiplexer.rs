//! Streaming event multiplexer
//!
//! A run merges the agent's primary event stream with the session's progress
//! side channel into one ordered sequence of [`StreamEvent`]s. It owns the
//! tool-invocation bookkeeping: deduplication, deferred emission of
//! invocations whose input is still incomplete, and restoring the execution
//! context while a tool result is processed.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use hub_core::config::HubConfig;
use hub_core::context::ExecutionContextRegistry;
use hub_core::event::{LifecyclePhase, StreamEvent};
use hub_core::message::{ChatMessage, ContentBlock, MessageRole, ToolStatus};
use hub_core::session::SessionState;

use crate::agent::{Agent, PrimaryEvents};
use crate::error::{Result, RunnerError};
use crate::event::{AgentEvent, LifecycleMarker};
use crate::format;
use crate::parser::{create_parser, MarkupParser, Segment};
use crate::progress::{ProgressHub, ProgressReceiver, ProgressUpdate};

/// One user message to stream
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub message: String,
    pub attachments: Vec<PathBuf>,
}

impl RunRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(path.into());
        self
    }
}

/// Hex SHA-256 of a message, used to spot duplicate requests
pub fn message_hash(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}

/// Runs currently streaming, by session and message hash
#[derive(Debug, Default)]
struct ActiveRuns {
    runs: StdMutex<HashSet<(String, String)>>,
}

impl ActiveRuns {
    /// Claim `(session, message)`; `None` if an identical run is streaming
    fn claim(self: &Arc<Self>, session_id: &str, message: &str) -> Option<RunGuard> {
        let key = (session_id.to_string(), message_hash(message));
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if !runs.insert(key.clone()) {
            return None;
        }
        Some(RunGuard {
            runs: Arc::clone(self),
            key,
        })
    }

    fn len(&self) -> usize {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Releases an [`ActiveRuns`] claim on drop
#[derive(Debug)]
pub struct RunGuard {
    runs: Arc<ActiveRuns>,
    key: (String, String),
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Client side of a run. Dropping it cancels the run.
pub struct RunStream {
    session_id: String,
    events: ReceiverStream<StreamEvent>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
}

impl RunStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stop the run; no further events are produced
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for RunStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.events.poll_next_unpin(cx)
    }
}

pub struct StreamMultiplexer {
    contexts: Arc<ExecutionContextRegistry>,
    progress: Arc<ProgressHub>,
    active: Arc<ActiveRuns>,
    keepalive_interval: Duration,
    event_buffer: usize,
}

impl StreamMultiplexer {
    pub fn new(
        contexts: Arc<ExecutionContextRegistry>,
        progress: Arc<ProgressHub>,
        config: &HubConfig,
    ) -> Self {
        Self {
            contexts,
            progress,
            active: Arc::new(ActiveRuns::default()),
            keepalive_interval: config.keepalive_interval,
            event_buffer: config.event_buffer.max(1),
        }
    }

    pub fn active_runs(&self) -> usize {
        self.active.len()
    }

    /// Reserve `(session, message)` for a run.
    ///
    /// Fails with [`RunnerError::DuplicateRun`] when the same message is
    /// already streaming for the session.
    pub fn claim(&self, session_id: &str, message: &str) -> Result<RunGuard> {
        self.active.claim(session_id, message).ok_or_else(|| {
            warn!("Rejecting duplicate request for session {}", session_id);
            RunnerError::DuplicateRun {
                session_id: session_id.to_string(),
            }
        })
    }

    /// Start streaming `request` through the session's agent
    pub fn start(
        &self,
        session: Arc<SessionState>,
        agent: Arc<Mutex<Agent>>,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunStream> {
        let guard = self.claim(session.id(), &request.message)?;
        Ok(self.start_claimed(guard, session, agent, request, cancel))
    }

    /// Start a run whose claim is already held
    pub fn start_claimed(
        &self,
        guard: RunGuard,
        session: Arc<SessionState>,
        agent: Arc<Mutex<Agent>>,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> RunStream {
        let session_id = session.id().to_string();
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let token = cancel.child_token();

        let run = Run {
            session_id: session_id.clone(),
            session,
            agent,
            request,
            tx,
            hub: Arc::clone(&self.progress),
            progress: None,
            primary: None,
            contexts: Arc::clone(&self.contexts),
            cancel: token.clone(),
            keepalive: self.keepalive_interval,
            parser: create_parser(),
            emitted: HashSet::new(),
            pending: HashMap::new(),
            tool_names: HashMap::new(),
            response_text: String::new(),
            _guard: guard,
        };
        tokio::spawn(ExecutionContextRegistry::scope(run.drive()));

        RunStream {
            session_id,
            events: ReceiverStream::new(rx),
            cancel: token.clone(),
            _cancel_on_drop: token.drop_guard(),
        }
    }
}

/// Why a run stopped early
enum Stop {
    Cancelled,
    Disconnected,
    Failed(String),
}

enum Wake {
    Cancelled,
    Primary(Option<anyhow::Result<AgentEvent>>),
    Progress(ProgressUpdate),
    Idle,
}

struct PendingInvocation {
    name: String,
    input: String,
}

struct Run {
    session_id: String,
    session: Arc<SessionState>,
    agent: Arc<Mutex<Agent>>,
    request: RunRequest,
    tx: mpsc::Sender<StreamEvent>,
    hub: Arc<ProgressHub>,
    progress: Option<ProgressReceiver>,
    primary: Option<PrimaryEvents>,
    contexts: Arc<ExecutionContextRegistry>,
    cancel: CancellationToken,
    keepalive: Duration,
    parser: Box<dyn MarkupParser>,
    /// Invocation IDs already emitted
    emitted: HashSet<String>,
    /// Invocations whose input does not parse yet
    pending: HashMap<String, PendingInvocation>,
    tool_names: HashMap<String, String>,
    response_text: String,
    _guard: RunGuard,
}

/// Cumulative argument text is usable once it parses as JSON
fn ready_input(raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

fn strip_markup(text: &str) -> String {
    let mut parser = create_parser();
    let mut segments = parser.feed(text);
    segments.extend(parser.finish());
    segments
        .into_iter()
        .filter_map(|s| match s {
            Segment::Text(text) => Some(text),
            Segment::ToolCall { .. } => None,
        })
        .collect()
}

async fn recv_progress(progress: Option<&mut ProgressReceiver>) -> Option<ProgressUpdate> {
    match progress {
        Some(progress) => progress.recv().await,
        None => std::future::pending().await,
    }
}

impl Run {
    async fn drive(mut self) {
        info!("Run started for session {}", self.session_id);

        let outcome = AssertUnwindSafe(self.execute())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Stop::Failed("internal error while streaming".to_string())));

        match outcome {
            Ok(()) => info!("Run completed for session {}", self.session_id),
            Err(Stop::Cancelled) => info!("Run cancelled for session {}", self.session_id),
            Err(Stop::Disconnected) => {
                info!("Client disconnected from session {}", self.session_id)
            }
            Err(Stop::Failed(message)) => {
                warn!("Run failed for session {}: {}", self.session_id, message);
                if !self.cancel.is_cancelled() {
                    let _ = self
                        .tx
                        .send(StreamEvent::error(&self.session_id, message))
                        .await;
                }
            }
        }

        self.cleanup().await;
    }

    async fn execute(&mut self) -> std::result::Result<(), Stop> {
        self.emit(StreamEvent::lifecycle(&self.session_id, LifecyclePhase::Init))
            .await?;

        let mut attachments = Vec::new();
        for path in &self.request.attachments {
            let block = ContentBlock::from_path(path).await.map_err(|e| {
                Stop::Failed(format!(
                    "Could not load attachment {}: {}",
                    path.display(),
                    e
                ))
            })?;
            attachments.push(block);
        }

        // runs of one session take turns on its agent
        let agent = Arc::clone(&self.agent);
        let mut agent = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
            agent = agent.lock_owned() => agent,
        };
        self.progress = Some(self.hub.register(&self.session_id));

        let mut content = vec![ContentBlock::text(&self.request.message)];
        content.extend(attachments.iter().cloned());
        self.session
            .append_message(ChatMessage::new(MessageRole::User, content))
            .await;

        let message = self.request.message.clone();
        let events = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
            events = agent.stream(&message, attachments) => {
                events.map_err(|e| Stop::Failed(format!("{:#}", e)))?
            }
        };
        self.primary = Some(events);

        loop {
            match self.next_wake().await {
                Wake::Cancelled => return Err(Stop::Cancelled),
                Wake::Idle => {
                    self.emit(StreamEvent::lifecycle(
                        &self.session_id,
                        LifecyclePhase::Keepalive,
                    ))
                    .await?
                }
                Wake::Progress(update) => self.emit_progress(update).await?,
                Wake::Primary(None) => {
                    self.drain_progress().await?;
                    return self.end_without_final(&mut agent).await;
                }
                Wake::Primary(Some(Err(e))) => {
                    self.drain_progress().await?;
                    return Err(Stop::Failed(format!("{:#}", e)));
                }
                Wake::Primary(Some(Ok(event))) => {
                    self.drain_progress().await?;
                    if self.handle(event, &mut agent).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn next_wake(&mut self) -> Wake {
        let Some(primary) = self.primary.as_mut() else {
            return Wake::Primary(None);
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Cancelled,
            event = primary.next() => Wake::Primary(event),
            Some(update) = recv_progress(self.progress.as_mut()) => Wake::Progress(update),
            _ = tokio::time::sleep(self.keepalive) => Wake::Idle,
        }
    }

    /// Handle one primary event; true once the run is complete
    async fn handle(&mut self, event: AgentEvent, agent: &mut Agent) -> std::result::Result<bool, Stop> {
        match event {
            AgentEvent::Lifecycle { marker } => {
                let phase = match marker {
                    LifecycleMarker::Init | LifecycleMarker::Start => LifecyclePhase::Initializing,
                    LifecycleMarker::StartEventLoop => LifecyclePhase::Thinking,
                };
                self.emit(StreamEvent::lifecycle(&self.session_id, phase))
                    .await?;
            }
            AgentEvent::ReasoningDelta { text } => {
                if !text.is_empty() {
                    self.emit(StreamEvent::reasoning(&self.session_id, text))
                        .await?;
                }
            }
            AgentEvent::TextDelta { text } => {
                let segments = self.parser.feed(&text);
                self.emit_segments(segments).await?;
            }
            AgentEvent::ToolUse { id, name, input } => {
                self.observe_tool_use(id, name, input).await?;
            }
            AgentEvent::ToolResult {
                tool_use_id,
                status,
                content,
            } => {
                self.process_tool_result(tool_use_id, status, content)
                    .await?;
            }
            AgentEvent::Final {
                message,
                stop_reason,
            } => {
                self.complete(agent, message, stop_reason).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn emit(&mut self, event: StreamEvent) -> std::result::Result<(), Stop> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Stop::Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| Stop::Disconnected),
        }
    }

    async fn emit_progress(&mut self, update: ProgressUpdate) -> std::result::Result<(), Stop> {
        self.emit(StreamEvent::progress(
            &self.session_id,
            update.invocation_id,
            update.message,
            update.percentage,
        ))
        .await
    }

    async fn drain_progress(&mut self) -> std::result::Result<(), Stop> {
        while let Some(update) = self.progress.as_mut().and_then(ProgressReceiver::try_recv) {
            self.emit_progress(update).await?;
        }
        Ok(())
    }

    async fn emit_segments(&mut self, segments: Vec<Segment>) -> std::result::Result<(), Stop> {
        for segment in segments {
            match segment {
                Segment::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.response_text.push_str(&text);
                    self.emit(StreamEvent::response_text(&self.session_id, text))
                        .await?;
                }
                Segment::ToolCall { id, name, input } => {
                    self.emit_invocation(id, name, input).await?;
                }
            }
        }
        Ok(())
    }

    async fn observe_tool_use(
        &mut self,
        id: String,
        name: String,
        input: String,
    ) -> std::result::Result<(), Stop> {
        if self.emitted.contains(&id) {
            debug!("Suppressing repeated invocation {}", id);
            return Ok(());
        }
        match ready_input(&input) {
            Some(value) => {
                self.pending.remove(&id);
                self.emit_invocation(id, name, value).await
            }
            None => {
                self.pending.insert(id, PendingInvocation { name, input });
                Ok(())
            }
        }
    }

    /// Emit an invocation at most once per ID
    async fn emit_invocation(
        &mut self,
        id: String,
        name: String,
        input: Value,
    ) -> std::result::Result<(), Stop> {
        if !self.emitted.insert(id.clone()) {
            return Ok(());
        }
        self.tool_names.insert(id.clone(), name.clone());
        self.session
            .append_message(ChatMessage::new(
                MessageRole::Assistant,
                vec![ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }],
            ))
            .await;
        self.emit(StreamEvent::tool_invocation(&self.session_id, id, name, input))
            .await
    }

    /// Emit an invocation still waiting for complete input because its
    /// result arrived, with `{}` when the input never parsed
    async fn flush_pending(&mut self, id: &str) -> std::result::Result<(), Stop> {
        if let Some(pending) = self.pending.remove(id) {
            let input = ready_input(&pending.input).unwrap_or_else(|| json!({}));
            self.emit_invocation(id.to_string(), pending.name, input).await?;
        }
        Ok(())
    }

    /// Forget invocations whose input never completed
    fn drop_pending(&mut self) {
        for (id, pending) in self.pending.drain() {
            debug!(
                "Dropping invocation {} of {} in session {}: input never completed",
                id, pending.name, self.session_id
            );
        }
    }

    async fn process_tool_result(
        &mut self,
        id: String,
        status: ToolStatus,
        content: Vec<ContentBlock>,
    ) -> std::result::Result<(), Stop> {
        self.flush_pending(&id).await?;

        let context = self.contexts.get(&id).await;
        if let Some(context) = &context {
            ExecutionContextRegistry::set_current(context.clone());
        }
        let tool_name = self
            .tool_names
            .get(&id)
            .cloned()
            .or_else(|| context.as_ref().map(|c| c.tool_name.clone()));

        self.session
            .append_message(ChatMessage::new(
                MessageRole::User,
                vec![ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    status,
                    content: content.clone(),
                }],
            ))
            .await;
        let output = format::render_tool_output(&content);
        let emitted = self
            .emit(StreamEvent::tool_result(
                &self.session_id,
                &id,
                tool_name,
                status,
                output,
            ))
            .await;

        ExecutionContextRegistry::clear_current();
        self.contexts.cleanup(&id).await;
        emitted
    }

    async fn flush_text(&mut self) -> std::result::Result<(), Stop> {
        let rest = self.parser.finish();
        self.emit_segments(rest).await?;
        self.drop_pending();
        Ok(())
    }

    async fn complete(
        &mut self,
        agent: &mut Agent,
        message: ChatMessage,
        stop_reason: String,
    ) -> std::result::Result<(), Stop> {
        self.flush_text().await?;

        let media = format::extract_media(&message);
        let text = match strip_markup(&message.text()) {
            text if text.is_empty() => self.response_text.clone(),
            text => text,
        };
        self.session.append_message(message.clone()).await;
        agent.push_history(message);

        self.emit(StreamEvent::complete(&self.session_id, stop_reason, text, media))
            .await
    }

    async fn end_without_final(&mut self, agent: &mut Agent) -> std::result::Result<(), Stop> {
        self.flush_text().await?;

        let text = self.response_text.clone();
        if !text.is_empty() {
            let message = ChatMessage::assistant(&text);
            self.session.append_message(message.clone()).await;
            agent.push_history(message);
        }
        debug!("Primary stream of session {} ended without a final message", self.session_id);
        self.emit(StreamEvent::complete(&self.session_id, "end_of_stream", text, Vec::new()))
            .await
    }

    async fn cleanup(&mut self) {
        if let Some(mut primary) = self.primary.take() {
            primary.close();
        }
        for id in self.tool_names.keys() {
            self.contexts.cleanup(id).await;
        }
        self.progress.take();
        ExecutionContextRegistry::clear_current();
    }
}
