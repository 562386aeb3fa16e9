//! Execution context registry
//!
//! Tracks which tool invocation is currently running and on behalf of which
//! session. The "current" context lives in tokio task-local storage, so two
//! invocations running concurrently on different tasks never see each other.
//! The registry map only exists so that a context created on one task can be
//! looked up and resumed on another (e.g. when the tool result is processed
//! by the stream multiplexer).

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_CONTEXT: RefCell<Option<ExecutionContext>>;
}

/// Context ambiently available inside a tool invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionContext {
    pub invocation_id: String,
    pub tool_name: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(
        invocation_id: impl Into<String>,
        tool_name: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            tool_name: tool_name.into(),
            session_id: session_id.into(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// How long ago the context was created
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Registry of live execution contexts, keyed by invocation ID
#[derive(Debug, Default)]
pub struct ExecutionContextRegistry {
    contexts: RwLock<HashMap<String, ExecutionContext>>,
}

impl ExecutionContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context, replacing any previous one with the same ID
    pub async fn create(
        &self,
        invocation_id: &str,
        tool_name: &str,
        session_id: &str,
    ) -> ExecutionContext {
        let context = ExecutionContext::new(invocation_id, tool_name, session_id);
        let mut contexts = self.contexts.write().await;
        if contexts
            .insert(invocation_id.to_string(), context.clone())
            .is_some()
        {
            debug!("Replaced execution context for invocation {}", invocation_id);
        }
        context
    }

    pub async fn get(&self, invocation_id: &str) -> Option<ExecutionContext> {
        self.contexts.read().await.get(invocation_id).cloned()
    }

    /// Attach a metadata entry to a registered context
    pub async fn insert_metadata(&self, invocation_id: &str, key: &str, value: Value) -> bool {
        let mut contexts = self.contexts.write().await;
        match contexts.get_mut(invocation_id) {
            Some(context) => {
                context.metadata.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    pub async fn cleanup(&self, invocation_id: &str) -> bool {
        self.contexts.write().await.remove(invocation_id).is_some()
    }

    /// Remove every context owned by a session
    pub async fn cleanup_session(&self, session_id: &str) -> usize {
        let mut contexts = self.contexts.write().await;
        let before = contexts.len();
        contexts.retain(|_, c| c.session_id != session_id);
        before - contexts.len()
    }

    /// Remove contexts older than `max_age`
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut contexts = self.contexts.write().await;
        let before = contexts.len();
        contexts.retain(|id, c| {
            let keep = c.age() < max_age;
            if !keep {
                debug!("Sweeping stale execution context {}", id);
            }
            keep
        });
        before - contexts.len()
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }

    /// Context of the invocation running on the current task, if any
    pub fn current() -> Option<ExecutionContext> {
        CURRENT_CONTEXT
            .try_with(|slot| slot.borrow().clone())
            .ok()
            .flatten()
    }

    /// Make `context` current for the rest of the enclosing [`scope`](Self::scope).
    ///
    /// Returns false when called outside any scope.
    pub fn set_current(context: ExecutionContext) -> bool {
        CURRENT_CONTEXT
            .try_with(|slot| {
                *slot.borrow_mut() = Some(context);
            })
            .is_ok()
    }

    /// Clear the current context, returning what was there
    pub fn clear_current() -> Option<ExecutionContext> {
        CURRENT_CONTEXT
            .try_with(|slot| slot.borrow_mut().take())
            .ok()
            .flatten()
    }

    /// Run `future` with an empty current-context slot that
    /// [`set_current`](Self::set_current) can fill.
    pub async fn scope<F: Future>(future: F) -> F::Output {
        CURRENT_CONTEXT.scope(RefCell::new(None), future).await
    }

    /// Run a tool body with its execution context installed as current.
    ///
    /// The owning session is taken from the enclosing invocation when there
    /// is one, then from `bound_session`; a detached ID is minted only when
    /// neither exists. Top-level contexts stay registered until the result is
    /// processed; nested ones are cleaned up as soon as the body finishes,
    /// since no result event will ever refer to them.
    pub async fn run_invocation<F: Future>(
        &self,
        invocation_id: &str,
        tool_name: &str,
        bound_session: Option<&str>,
        future: F,
    ) -> F::Output {
        let parent = Self::current();
        let session_id = match (&parent, bound_session) {
            (Some(parent), _) => parent.session_id.clone(),
            (None, Some(session_id)) => session_id.to_string(),
            (None, None) => format!("detached-{}", Uuid::new_v4()),
        };

        let context = self.create(invocation_id, tool_name, &session_id).await;
        let output = CURRENT_CONTEXT
            .scope(RefCell::new(Some(context)), future)
            .await;

        if parent.is_some() {
            self.cleanup(invocation_id).await;
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_get_cleanup() {
        let registry = ExecutionContextRegistry::new();
        registry.create("t1", "search", "s1").await;

        let context = registry.get("t1").await.unwrap();
        assert_eq!(context.tool_name, "search");
        assert_eq!(context.session_id, "s1");
        assert!(registry.get("unknown").await.is_none());

        assert!(registry.insert_metadata("t1", "attempt", serde_json::json!(2)).await);
        assert!(!registry.insert_metadata("unknown", "attempt", serde_json::json!(2)).await);
        assert_eq!(registry.get("t1").await.unwrap().metadata["attempt"], 2);

        assert!(registry.cleanup("t1").await);
        assert!(!registry.cleanup("t1").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_current_outside_scope() {
        assert!(ExecutionContextRegistry::current().is_none());
        assert!(!ExecutionContextRegistry::set_current(ExecutionContext::new("t", "x", "s")));
        assert!(ExecutionContextRegistry::clear_current().is_none());
    }

    #[tokio::test]
    async fn test_set_and_clear_current_in_scope() {
        ExecutionContextRegistry::scope(async {
            assert!(ExecutionContextRegistry::current().is_none());
            assert!(ExecutionContextRegistry::set_current(ExecutionContext::new(
                "t1", "search", "s1"
            )));
            assert_eq!(
                ExecutionContextRegistry::current().unwrap().invocation_id,
                "t1"
            );
            let cleared = ExecutionContextRegistry::clear_current().unwrap();
            assert_eq!(cleared.session_id, "s1");
            assert!(ExecutionContextRegistry::current().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_nested_invocation_inherits_session() {
        let registry = Arc::new(ExecutionContextRegistry::new());

        let inner_registry = Arc::clone(&registry);
        let (outer_session, inner_session) = registry
            .run_invocation("outer", "delegate", Some("s1"), async move {
                let outer = ExecutionContextRegistry::current().unwrap().session_id;
                let inner = inner_registry
                    .run_invocation("inner", "search", None, async {
                        ExecutionContextRegistry::current().unwrap().session_id
                    })
                    .await;
                (outer, inner)
            })
            .await;

        assert_eq!(outer_session, "s1");
        assert_eq!(inner_session, "s1");
        // top-level context is kept for result processing, nested one is gone
        assert!(registry.get("outer").await.is_some());
        assert!(registry.get("inner").await.is_none());
        assert!(ExecutionContextRegistry::current().is_none());
    }

    #[tokio::test]
    async fn test_unbound_invocation_gets_detached_session() {
        let registry = ExecutionContextRegistry::new();
        let session = registry
            .run_invocation("t1", "search", None, async {
                ExecutionContextRegistry::current().unwrap().session_id
            })
            .await;
        assert!(session.starts_with("detached-"));
    }

    #[tokio::test]
    async fn test_concurrent_tasks_are_isolated() {
        let registry = Arc::new(ExecutionContextRegistry::new());
        let mut handles = Vec::new();

        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let session = format!("s{}", i);
                let invocation = format!("t{}", i);
                registry
                    .run_invocation(&invocation, "echo", Some(&session), async {
                        tokio::task::yield_now().await;
                        ExecutionContextRegistry::current().unwrap()
                    })
                    .await
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let context = handle.await.unwrap();
            assert_eq!(context.session_id, format!("s{}", i));
            assert_eq!(context.invocation_id, format!("t{}", i));
        }
    }

    #[tokio::test]
    async fn test_cleanup_session_and_sweep() {
        let registry = ExecutionContextRegistry::new();
        registry.create("a", "x", "s1").await;
        registry.create("b", "x", "s1").await;
        registry.create("c", "x", "s2").await;

        assert_eq!(registry.cleanup_session("s1").await, 2);
        assert_eq!(registry.len().await, 1);

        assert_eq!(registry.sweep(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.sweep(Duration::ZERO).await, 1);
        assert!(registry.is_empty().await);
    }
}
