//! How connections to tool servers are opened

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{info, warn};

use hub_core::session::{ToolServerDescriptor, TransportConfig};

use super::http::HttpToolClient;
use super::jsonrpc::REQUEST_TIMEOUT;
use super::stdio::StdioToolClient;
use crate::agent::{ToolOutput, ToolSpec};
use crate::error::PoolError;

/// An open connection to one tool server
#[async_trait]
pub trait ToolServerClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, PoolError>;

    async fn call_tool(&self, name: &str, input: Value) -> Result<ToolOutput, PoolError>;

    /// Release the underlying process or session
    async fn close(&self);
}

/// Opens client connections for descriptors
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ToolServerDescriptor,
    ) -> Result<Arc<dyn ToolServerClient>, PoolError>;
}

/// JSON-RPC transport over child-process stdio or HTTP
pub struct JsonRpcTransport {
    http: Client,
}

impl JsonRpcTransport {
    pub fn new() -> Self {
        Self::with_request_timeout(REQUEST_TIMEOUT)
    }

    /// Bound every HTTP request, connect through response body, by `timeout`
    pub fn with_request_timeout(timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });
        Self { http }
    }
}

impl Default for JsonRpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolTransport for JsonRpcTransport {
    async fn connect(
        &self,
        descriptor: &ToolServerDescriptor,
    ) -> Result<Arc<dyn ToolServerClient>, PoolError> {
        info!(
            "Connecting to tool server {} at {}",
            descriptor.id,
            descriptor.transport.destination()
        );
        match &descriptor.transport {
            TransportConfig::Stdio { command, args, env } => {
                let client = StdioToolClient::spawn(&descriptor.id, command, args, env)?;
                client.initialize().await?;
                Ok(Arc::new(client))
            }
            TransportConfig::Http { url, headers } => {
                let client =
                    HttpToolClient::new(&descriptor.id, self.http.clone(), url, headers.clone());
                client.initialize().await?;
                Ok(Arc::new(client))
            }
        }
    }
}
