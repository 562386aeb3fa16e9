//! Composition root
//!
//! Wires the registry, pool, context registry, progress hub and workers
//! together and owns the background sweeps.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use hub_core::config::HubConfig;
use hub_core::context::ExecutionContextRegistry;

use crate::agent::ModelBackend;
use crate::multiplexer::StreamMultiplexer;
use crate::pool::{JsonRpcTransport, ToolConnectionPool, ToolTransport};
use crate::progress::ProgressHub;
use crate::registry::{SessionDefaults, SessionRegistry};
use crate::worker::SessionWorkers;

/// What one sweep pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sessions: Vec<String>,
    pub contexts: usize,
    pub connections: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.contexts == 0 && self.connections == 0
    }
}

pub struct Hub {
    config: HubConfig,
    registry: Arc<SessionRegistry>,
    pool: Arc<ToolConnectionPool>,
    contexts: Arc<ExecutionContextRegistry>,
    progress: Arc<ProgressHub>,
    workers: Arc<SessionWorkers>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        backend: Arc<dyn ModelBackend>,
        transport: Arc<dyn ToolTransport>,
        defaults: SessionDefaults,
    ) -> Self {
        let contexts = Arc::new(ExecutionContextRegistry::new());
        let progress = Arc::new(ProgressHub::new());
        let workers = Arc::new(SessionWorkers::new());
        let pool = Arc::new(ToolConnectionPool::new(
            transport,
            config.connection_drain_timeout,
        ));
        let multiplexer =
            StreamMultiplexer::new(Arc::clone(&contexts), Arc::clone(&progress), &config);
        let registry = Arc::new(SessionRegistry::new(
            backend,
            Arc::clone(&pool),
            Arc::clone(&contexts),
            Arc::clone(&workers),
            multiplexer,
            defaults,
        ));

        Self {
            config,
            registry,
            pool,
            contexts,
            progress,
            workers,
            shutdown: CancellationToken::new(),
        }
    }

    /// Hub reaching tool servers over stdio and HTTP JSON-RPC
    pub fn with_json_rpc_transport(
        config: HubConfig,
        backend: Arc<dyn ModelBackend>,
        defaults: SessionDefaults,
    ) -> Self {
        Self::new(
            config,
            backend,
            Arc::new(JsonRpcTransport::default()),
            defaults,
        )
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ToolConnectionPool> {
        &self.pool
    }

    pub fn contexts(&self) -> &Arc<ExecutionContextRegistry> {
        &self.contexts
    }

    /// Hub that tools publish progress updates to
    pub fn progress(&self) -> &Arc<ProgressHub> {
        &self.progress
    }

    pub fn workers(&self) -> &Arc<SessionWorkers> {
        &self.workers
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); runs started with a
    /// child of it stop with the hub
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run every sweep once
    pub async fn sweep_once(&self) -> SweepReport {
        let report = SweepReport {
            sessions: self.registry.sweep(self.config.session_idle_timeout).await,
            contexts: self.contexts.sweep(self.config.context_max_age).await,
            connections: self
                .pool
                .sweep_idle(self.config.connection_idle_timeout)
                .await,
        };
        if report.is_empty() {
            debug!("Sweep found nothing to remove");
        } else {
            info!(
                "Swept {} sessions, {} execution contexts, {} connections",
                report.sessions.len(),
                report.contexts,
                report.connections
            );
        }
        report
    }

    /// Start the background sweeper. It stops on [`shutdown`](Self::shutdown).
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = hub.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        hub.sweep_once().await;
                    }
                }
            }
            debug!("Sweeper stopped");
        })
    }

    /// Stop background work, cancel runs and close every tool connection
    pub async fn shutdown(&self) {
        info!("Shutting down hub");
        self.shutdown.cancel();
        let closed = self.pool.invalidate(None, None).await;
        self.workers.shutdown_all().await;
        debug!("Closed {} tool connections", closed);
    }
}
