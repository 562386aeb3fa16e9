//! Session registry
//!
//! Owns every live session and the agent bound to it. The first caller to
//! touch an unknown session ID builds it; concurrent callers for the same ID
//! wait for that single construction instead of racing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use hub_core::context::ExecutionContextRegistry;
use hub_core::session::{
    ConfigRejected, ModelConfig, ModelConfigUpdate, SessionState, SystemPrompt, ToolConfig,
    ToolServerDescriptor,
};

use crate::agent::{Agent, ModelBackend};
use crate::error::Result;
use crate::multiplexer::{RunRequest, RunStream, StreamMultiplexer};
use crate::pool::{fingerprint, ToolConnectionPool};
use crate::worker::SessionWorkers;

/// Configuration given to newly created sessions
#[derive(Debug, Clone, Default)]
pub struct SessionDefaults {
    pub model: ModelConfig,
    pub tools: ToolConfig,
}

/// A live session and its agent
#[derive(Clone)]
pub struct SessionHandle {
    pub state: Arc<SessionState>,
    pub agent: Arc<Mutex<Agent>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        self.state.id()
    }
}

/// Listing entry for a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: usize,
    pub tool_servers: usize,
    pub model_id: String,
}

/// Aggregate numbers across the registry
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub sessions: usize,
    pub sessions_created: u64,
    pub total_messages: usize,
    pub approx_memory_bytes: usize,
    pub pooled_connections: usize,
    pub active_contexts: usize,
    pub active_runs: usize,
    pub workers: usize,
}

type SessionCell = Arc<OnceCell<SessionHandle>>;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionCell>>,
    backend: Arc<dyn ModelBackend>,
    pool: Arc<ToolConnectionPool>,
    contexts: Arc<ExecutionContextRegistry>,
    workers: Arc<SessionWorkers>,
    multiplexer: StreamMultiplexer,
    defaults: SessionDefaults,
    created: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        pool: Arc<ToolConnectionPool>,
        contexts: Arc<ExecutionContextRegistry>,
        workers: Arc<SessionWorkers>,
        multiplexer: StreamMultiplexer,
        defaults: SessionDefaults,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            backend,
            pool,
            contexts,
            workers,
            multiplexer,
            defaults,
            created: AtomicU64::new(0),
        }
    }

    /// Get a session, creating it on first use. A fresh ID is generated when
    /// none is given.
    pub async fn get_or_create(&self, session_id: Option<&str>) -> SessionHandle {
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let cell = self.cell(&session_id).await;
        let handle = cell
            .get_or_init(|| self.build_session(&session_id))
            .await
            .clone();
        handle.state.touch().await;
        handle
    }

    async fn cell(&self, session_id: &str) -> SessionCell {
        if let Some(cell) = self.sessions.read().await.get(session_id) {
            return Arc::clone(cell);
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(session_id.to_string()).or_default())
    }

    async fn build_session(&self, session_id: &str) -> SessionHandle {
        info!("Creating session {}", session_id);
        self.created.fetch_add(1, Ordering::SeqCst);

        let state = Arc::new(SessionState::new(
            session_id,
            self.defaults.model.clone(),
            self.defaults.tools.clone(),
        ));
        let tools = self
            .pool
            .resolve(session_id, &self.defaults.tools.enabled())
            .await;
        let agent = Agent::new(
            session_id,
            Arc::clone(&self.backend),
            self.defaults.model.clone(),
            tools,
            &self.contexts,
        );
        SessionHandle {
            state,
            agent: Arc::new(Mutex::new(agent)),
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        let cell = self.sessions.read().await.get(session_id).cloned()?;
        cell.get().cloned()
    }

    async fn require(&self, session_id: &str) -> std::result::Result<SessionHandle, ConfigRejected> {
        self.get(session_id)
            .await
            .ok_or_else(|| ConfigRejected::UnknownSession(session_id.to_string()))
    }

    async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .await
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for handle in self.handles().await {
            let state = &handle.state;
            summaries.push(SessionSummary {
                session_id: state.id().to_string(),
                created_at: state.created_at(),
                last_activity: state.last_activity().await,
                message_count: state.message_count().await,
                tool_servers: state.tool_config().await.servers.len(),
                model_id: state.model_config().await.model_id,
            });
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub async fn stats(&self) -> RegistryStats {
        let handles = self.handles().await;
        let mut stats = RegistryStats {
            sessions: handles.len(),
            sessions_created: self.created.load(Ordering::SeqCst),
            pooled_connections: self.pool.connection_count().await,
            active_contexts: self.contexts.len().await,
            active_runs: self.multiplexer.active_runs(),
            workers: self.workers.len().await,
            ..RegistryStats::default()
        };
        for handle in handles {
            stats.total_messages += handle.state.message_count().await;
            stats.approx_memory_bytes += handle.state.approx_memory_bytes().await;
        }
        stats
    }

    /// Drop a session's conversation, keeping the session and its config
    pub async fn clear(&self, session_id: &str) -> bool {
        let Some(handle) = self.get(session_id).await else {
            return false;
        };
        handle.state.clear_history().await;
        handle.agent.lock().await.clear_history();
        let contexts = self.contexts.cleanup_session(session_id).await;
        debug!(
            "Cleared session {} ({} execution contexts dropped)",
            session_id, contexts
        );
        true
    }

    /// Remove a session and everything it owns
    pub async fn delete(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_none() {
            return false;
        }
        self.teardown(session_id).await;
        info!("Deleted session {}", session_id);
        true
    }

    async fn teardown(&self, session_id: &str) {
        self.contexts.cleanup_session(session_id).await;
        self.pool.invalidate(Some(session_id), None).await;
        self.workers.release(session_id).await;
    }

    /// Delete sessions idle for longer than `idle_timeout`. Sessions touched
    /// or streaming while the sweep runs are kept.
    pub async fn sweep(&self, idle_timeout: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::MAX);

        let mut candidates = Vec::new();
        for handle in self.handles().await {
            if handle.state.last_activity().await < cutoff {
                candidates.push(handle.id().to_string());
            }
        }

        let mut swept = Vec::new();
        for session_id in candidates {
            let removed = {
                let mut sessions = self.sessions.write().await;
                let Some(handle) = sessions.get(&session_id).and_then(|c| c.get().cloned()) else {
                    continue;
                };
                // re-check under the write lock; a busy agent means a run is live
                let still_idle = handle.state.last_activity().await < cutoff
                    && handle.agent.try_lock().is_ok();
                still_idle && sessions.remove(&session_id).is_some()
            };
            if removed {
                self.teardown(&session_id).await;
                info!("Swept idle session {}", session_id);
                swept.push(session_id);
            }
        }
        swept
    }

    /// Rebuild the agent if the session's configuration changed since it was built
    async fn prepare_agent(&self, handle: &SessionHandle) {
        if !handle.state.has_config_changes().await {
            return;
        }
        let mut agent = handle.agent.lock().await;
        if !handle.state.has_config_changes().await {
            return;
        }
        // reset first so a change landing mid-rebuild is picked up next time
        handle.state.reset_config_change_flags().await;
        let model = handle.state.model_config().await;
        let tools = self
            .pool
            .resolve(handle.id(), &handle.state.enabled_tools().await)
            .await;
        *agent = agent.rebuild(model, tools, &self.contexts);
    }

    /// Stream a user message through a session's agent
    pub async fn stream_message(
        &self,
        session_id: Option<&str>,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunStream> {
        let handle = self.get_or_create(session_id).await;
        let guard = self.multiplexer.claim(handle.id(), &request.message)?;
        self.prepare_agent(&handle).await;
        Ok(self.multiplexer.start_claimed(
            guard,
            Arc::clone(&handle.state),
            Arc::clone(&handle.agent),
            request,
            cancel,
        ))
    }

    /// Names of the tools the session's agent will use on its next turn
    pub async fn tool_names(&self, session_id: &str) -> std::result::Result<Vec<String>, ConfigRejected> {
        let handle = self.require(session_id).await?;
        self.prepare_agent(&handle).await;
        let names = handle.agent.lock().await.tool_names();
        Ok(names)
    }

    pub async fn set_tool_servers(
        &self,
        session_id: &str,
        servers: Vec<ToolServerDescriptor>,
    ) -> std::result::Result<ToolConfig, ConfigRejected> {
        let handle = self.require(session_id).await?;
        let before = handle.state.tool_config().await;
        let after = handle.state.set_tool_servers(servers).await?;
        self.invalidate_stale(session_id, &before, &after).await;
        Ok(after)
    }

    pub async fn upsert_tool_server(
        &self,
        session_id: &str,
        server: ToolServerDescriptor,
    ) -> std::result::Result<ToolConfig, ConfigRejected> {
        let handle = self.require(session_id).await?;
        let before = handle.state.tool_config().await;
        let after = handle.state.upsert_tool_server(server).await?;
        self.invalidate_stale(session_id, &before, &after).await;
        Ok(after)
    }

    /// Close this session's connections that no longer match its tool config
    async fn invalidate_stale(&self, session_id: &str, before: &ToolConfig, after: &ToolConfig) {
        for server_id in stale_servers(before, after) {
            self.pool.invalidate(Some(session_id), Some(&server_id)).await;
        }
    }

    pub async fn remove_tool_server(
        &self,
        session_id: &str,
        server_id: &str,
    ) -> std::result::Result<ToolConfig, ConfigRejected> {
        let config = self
            .require(session_id)
            .await?
            .state
            .remove_tool_server(server_id)
            .await?;
        self.pool.invalidate(Some(session_id), Some(server_id)).await;
        Ok(config)
    }

    pub async fn set_tool_enabled(
        &self,
        session_id: &str,
        server_id: &str,
        enabled: bool,
    ) -> std::result::Result<ToolConfig, ConfigRejected> {
        let config = self
            .require(session_id)
            .await?
            .state
            .set_tool_enabled(server_id, enabled)
            .await?;
        if !enabled {
            self.pool.invalidate(Some(session_id), Some(server_id)).await;
        }
        Ok(config)
    }

    pub async fn update_model_config(
        &self,
        session_id: &str,
        update: ModelConfigUpdate,
    ) -> std::result::Result<ModelConfig, ConfigRejected> {
        self.require(session_id)
            .await?
            .state
            .update_model_config(update)
            .await
    }

    pub async fn add_system_prompt(
        &self,
        session_id: &str,
        name: &str,
        text: &str,
        activate: bool,
    ) -> std::result::Result<SystemPrompt, ConfigRejected> {
        let handle = self.require(session_id).await?;
        Ok(handle.state.add_system_prompt(name, text, activate).await)
    }

    pub async fn activate_system_prompt(
        &self,
        session_id: &str,
        prompt_id: &str,
    ) -> std::result::Result<ModelConfig, ConfigRejected> {
        self.require(session_id)
            .await?
            .state
            .activate_system_prompt(prompt_id)
            .await
    }

    pub async fn update_system_prompt(
        &self,
        session_id: &str,
        prompt_id: &str,
        name: Option<String>,
        text: Option<String>,
    ) -> std::result::Result<ModelConfig, ConfigRejected> {
        self.require(session_id)
            .await?
            .state
            .update_system_prompt(prompt_id, name, text)
            .await
    }

    pub async fn delete_system_prompt(
        &self,
        session_id: &str,
        prompt_id: &str,
    ) -> std::result::Result<ModelConfig, ConfigRejected> {
        self.require(session_id)
            .await?
            .state
            .delete_system_prompt(prompt_id)
            .await
    }
}

fn stale_servers(before: &ToolConfig, after: &ToolConfig) -> Vec<String> {
    before
        .servers
        .iter()
        .filter(|(id, old)| match after.servers.get(*id) {
            None => true,
            Some(new) => {
                !new.enabled
                    || new.stateless != old.stateless
                    || fingerprint(&new.transport) != fingerprint(&old.transport)
            }
        })
        .map(|(id, _)| id.clone())
        .collect()
}
