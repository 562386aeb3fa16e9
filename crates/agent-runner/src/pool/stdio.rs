//! Tool server running as a child process, JSON-RPC over stdin/stdout

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use super::jsonrpc::{self, RpcRequest, RpcResponse, REQUEST_TIMEOUT};
use super::transport::ToolServerClient;
use crate::agent::{ToolOutput, ToolSpec};
use crate::error::PoolError;

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

pub struct StdioToolClient {
    server_id: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: Pending,
    exited: Arc<AtomicBool>,
    next_id: AtomicU64,
    stdout_handle: tokio::task::JoinHandle<()>,
    stderr_handle: tokio::task::JoinHandle<()>,
}

impl StdioToolClient {
    /// Spawn the server process and start reading its output
    pub fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Self, PoolError> {
        debug!("Spawning tool server {}: {} {:?}", server_id, command, args);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            PoolError::connect(server_id, format!("failed to spawn {}: {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::connect(server_id, "failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::connect(server_id, "failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PoolError::connect(server_id, "failed to capture stderr"))?;

        let pending: Pending = Arc::default();
        let exited = Arc::new(AtomicBool::new(false));

        let stdout_pending = Arc::clone(&pending);
        let stdout_exited = Arc::clone(&exited);
        let stdout_server = server_id.to_string();
        let stdout_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response: RpcResponse = match serde_json::from_str(line) {
                    Ok(response) => response,
                    Err(_) => {
                        debug!("{} stdout: {}", stdout_server, line);
                        continue;
                    }
                };
                let Some(id) = response.numeric_id() else {
                    // server-initiated notification
                    continue;
                };
                let waiter = stdout_pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => warn!("{} answered unknown request {}", stdout_server, id),
                }
            }
            debug!("Tool server {} closed stdout", stdout_server);
            stdout_exited.store(true, Ordering::SeqCst);
            // dropping the senders fails every outstanding request
            stdout_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        });

        let stderr_server = server_id.to_string();
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("{} stderr: {}", stderr_server, line);
            }
        });

        Ok(Self {
            server_id: server_id.to_string(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            pending,
            exited,
            next_id: AtomicU64::new(1),
            stdout_handle,
            stderr_handle,
        })
    }

    /// Perform the protocol handshake
    pub async fn initialize(&self) -> Result<(), PoolError> {
        self.request("initialize", jsonrpc::initialize_params())
            .await
            .map_err(|e| PoolError::connect(&self.server_id, e.to_string()))?;
        self.write_line(&RpcRequest::notification("notifications/initialized"))
            .await
    }

    async fn write_line(&self, request: &RpcRequest<'_>) -> Result<(), PoolError> {
        let mut line = serde_json::to_vec(request)
            .map_err(|e| PoolError::InvalidResponse(e.to_string()))?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| PoolError::transport(&self.server_id, "connection closed"))?;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, PoolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        if self.exited.load(Ordering::SeqCst) {
            self.forget(id);
            return Err(PoolError::transport(&self.server_id, "server has exited"));
        }

        if let Err(e) = self.write_line(&RpcRequest::call(id, method, params)).await {
            self.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => response.into_result(&self.server_id),
            Ok(Err(_)) => Err(PoolError::transport(
                &self.server_id,
                "server exited before answering",
            )),
            Err(_) => {
                self.forget(id);
                Err(PoolError::transport(
                    &self.server_id,
                    format!("{} timed out", method),
                ))
            }
        }
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

#[async_trait]
impl ToolServerClient for StdioToolClient {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, PoolError> {
        let result = self.request("tools/list", Value::Null).await?;
        jsonrpc::parse_tool_list(result)
    }

    async fn call_tool(&self, name: &str, input: Value) -> Result<ToolOutput, PoolError> {
        let result = self
            .request("tools/call", jsonrpc::call_params(name, input))
            .await?;
        Ok(jsonrpc::parse_call_result(result))
    }

    async fn close(&self) {
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("Tool server {} already gone: {}", self.server_id, e);
            }
        }
        self.stdout_handle.abort();
        self.stderr_handle.abort();
    }
}
