//! Dedicated per-session workers for blocking work
//!
//! Some tools need to run blocking code with a stable thread identity per
//! session. Each session gets one OS thread that executes jobs in order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use hub_core::context::ExecutionContextRegistry;

use crate::error::{Result, RunnerError};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct SessionWorker {
    session_id: String,
    jobs: async_channel::Sender<Job>,
}

impl SessionWorker {
    fn spawn(session_id: &str) -> Result<Self> {
        let (tx, rx) = async_channel::unbounded::<Job>();
        let name = format!(
            "session-worker-{}",
            session_id.chars().take(16).collect::<String>()
        );
        let thread_session = session_id.to_string();
        thread::Builder::new().name(name).spawn(move || {
            while let Ok(job) = rx.recv_blocking() {
                job();
            }
            debug!("Worker for session {} stopped", thread_session);
        })?;
        Ok(Self {
            session_id: session_id.to_string(),
            jobs: tx,
        })
    }

    /// Run `job` on this worker's thread and wait for its result
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            let _ = tx.send(catch_unwind(AssertUnwindSafe(job)));
        });
        self.jobs
            .send(wrapped)
            .await
            .map_err(|_| RunnerError::WorkerClosed {
                session_id: self.session_id.clone(),
            })?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                warn!("Job on worker for session {} panicked", self.session_id);
                Err(RunnerError::WorkerJobPanicked {
                    session_id: self.session_id.clone(),
                })
            }
            Err(_) => Err(RunnerError::WorkerClosed {
                session_id: self.session_id.clone(),
            }),
        }
    }

    /// Stop accepting jobs; queued jobs still run
    fn shutdown(&self) {
        self.jobs.close();
    }
}

#[derive(Default)]
pub struct SessionWorkers {
    workers: Mutex<HashMap<String, Arc<SessionWorker>>>,
}

impl SessionWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session's worker, started on first use
    pub async fn worker(&self, session_id: &str) -> Result<Arc<SessionWorker>> {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get(session_id) {
            return Ok(Arc::clone(worker));
        }
        let worker = Arc::new(SessionWorker::spawn(session_id)?);
        workers.insert(session_id.to_string(), Arc::clone(&worker));
        Ok(worker)
    }

    pub async fn run<F, T>(&self, session_id: &str, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.worker(session_id).await?.run(job).await
    }

    /// Run on the worker of the session owning the current tool invocation
    pub async fn run_for_current<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let context = ExecutionContextRegistry::current().ok_or(RunnerError::NoCurrentContext)?;
        self.run(&context.session_id, job).await
    }

    /// Stop a session's worker
    pub async fn release(&self, session_id: &str) -> bool {
        match self.workers.lock().await.remove(session_id) {
            Some(worker) => {
                worker.shutdown();
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&self) {
        for (_, worker) in self.workers.lock().await.drain() {
            worker.shutdown();
        }
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.lock().await.is_empty()
    }
}
