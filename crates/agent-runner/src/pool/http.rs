//! Tool server reached over HTTP

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::jsonrpc::{self, RpcRequest, RpcResponse};
use super::transport::ToolServerClient;
use crate::agent::{ToolOutput, ToolSpec};
use crate::error::PoolError;

const SESSION_HEADER: &str = "mcp-session-id";

pub struct HttpToolClient {
    server_id: String,
    client: Client,
    url: String,
    headers: BTreeMap<String, String>,
    session: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl HttpToolClient {
    pub fn new(
        server_id: &str,
        client: Client,
        url: &str,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            client,
            url: url.to_string(),
            headers,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn initialize(&self) -> Result<(), PoolError> {
        self.request("initialize", jsonrpc::initialize_params())
            .await
            .map_err(|e| PoolError::connect(&self.server_id, e.to_string()))?;
        self.post(&RpcRequest::notification("notifications/initialized"))
            .await?;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn post(&self, body: &RpcRequest<'_>) -> Result<reqwest::Response, PoolError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("accept", "application/json, text/event-stream")
            .json(body);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PoolError::transport(&self.server_id, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(PoolError::transport(
                &self.server_id,
                format!("HTTP {}: {}", status, error_text),
            ));
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.to_string());
        }
        Ok(response)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, PoolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self.post(&RpcRequest::call(id, method, params)).await?;

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let body = response.text().await?;

        let parsed = if is_event_stream {
            find_sse_response(&body, id)
        } else {
            serde_json::from_str::<RpcResponse>(&body).ok()
        };
        let parsed = parsed.ok_or_else(|| {
            PoolError::InvalidResponse(format!("no JSON-RPC response for {}", method))
        })?;
        parsed.into_result(&self.server_id)
    }
}

/// Pick the response to request `id` out of an SSE body
fn find_sse_response(body: &str, id: u64) -> Option<RpcResponse> {
    body.split("\n\n")
        .filter_map(|frame| {
            let data: String = frame
                .lines()
                .filter_map(|l| l.strip_prefix("data:"))
                .map(str::trim_start)
                .collect();
            serde_json::from_str::<RpcResponse>(&data).ok()
        })
        .find(|r| r.numeric_id() == Some(id))
}

#[async_trait]
impl ToolServerClient for HttpToolClient {
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
        let Some(session) = self.session_id() else {
            return;
        };
        let mut request = self.client.delete(&self.url).header(SESSION_HEADER, session);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Err(e) = request.send().await {
            debug!("Closing HTTP session for {} failed: {}", self.server_id, e);
        }
    }
}
