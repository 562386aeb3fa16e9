//! Side channel for tool progress updates
//!
//! Tools publish progress for their session while the run that started them
//! is streaming; the run interleaves the updates with primary events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use hub_core::context::ExecutionContextRegistry;

/// A progress update from a running tool
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub invocation_id: Option<String>,
    pub message: String,
    pub percentage: Option<f32>,
}

#[derive(Debug, Default)]
pub struct ProgressHub {
    channels: Mutex<HashMap<String, (u64, mpsc::UnboundedSender<ProgressUpdate>)>>,
    next_id: AtomicU64,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start receiving progress for a session, replacing any earlier receiver
    pub fn register(self: &Arc<Self>, session_id: &str) -> ProgressReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(session_id.to_string(), (id, tx));
        ProgressReceiver {
            session_id: session_id.to_string(),
            id,
            rx,
            hub: Arc::clone(self),
        }
    }

    /// Queue an update for a session; false when nobody is listening
    pub fn publish(&self, session_id: &str, update: ProgressUpdate) -> bool {
        match self.lock().get(session_id) {
            Some((_, tx)) => tx.send(update).is_ok(),
            None => {
                debug!("Dropping progress for idle session {}", session_id);
                false
            }
        }
    }

    /// Publish on behalf of the tool invocation running on this task
    pub fn publish_current(&self, message: impl Into<String>, percentage: Option<f32>) -> bool {
        let Some(context) = ExecutionContextRegistry::current() else {
            debug!("Progress published outside any tool invocation");
            return false;
        };
        self.publish(
            &context.session_id,
            ProgressUpdate {
                invocation_id: Some(context.invocation_id),
                message: message.into(),
                percentage,
            },
        )
    }

    pub fn is_listening(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, (u64, mpsc::UnboundedSender<ProgressUpdate>)>>
    {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Receiving end for one run; unregisters on drop
pub struct ProgressReceiver {
    session_id: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<ProgressUpdate>,
    hub: Arc<ProgressHub>,
}

impl ProgressReceiver {
    pub async fn recv(&mut self) -> Option<ProgressUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressUpdate> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ProgressReceiver {
    fn drop(&mut self) {
        let mut channels = self.hub.lock();
        if channels.get(&self.session_id).is_some_and(|(id, _)| *id == self.id) {
            channels.remove(&self.session_id);
        }
    }
}
