//! JSON-RPC message shapes shared by the stdio and HTTP clients

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use hub_core::message::{ContentBlock, ToolStatus};

use crate::agent::{ToolOutput, ToolSpec};
use crate::error::PoolError;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on a single request to a tool server
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl<'a> RpcRequest<'a> {
    pub fn call(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        }
    }

    pub fn notification(method: &'a str) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method,
            params: Value::Null,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    /// Numeric request ID this response answers, if any
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    pub fn into_result(self, server_id: &str) -> Result<Value, PoolError> {
        if let Some(error) = self.error {
            return Err(PoolError::Rpc {
                server_id: server_id.to_string(),
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "agent-hub",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

pub fn call_params(name: &str, input: Value) -> Value {
    let arguments = if input.is_null() { json!({}) } else { input };
    json!({ "name": name, "arguments": arguments })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ToolList {
    #[serde(default)]
    tools: Vec<ListedTool>,
}

/// Parse a `tools/list` result
pub fn parse_tool_list(result: Value) -> Result<Vec<ToolSpec>, PoolError> {
    let list: ToolList = serde_json::from_value(result)
        .map_err(|e| PoolError::InvalidResponse(format!("bad tools/list result: {}", e)))?;
    Ok(list
        .tools
        .into_iter()
        .map(|t| ToolSpec {
            name: t.name,
            description: t.description,
            input_schema: t.input_schema,
        })
        .collect())
}

/// Parse a `tools/call` result into tool output
pub fn parse_call_result(result: Value) -> ToolOutput {
    let status = if result["isError"].as_bool().unwrap_or(false) {
        ToolStatus::Error
    } else {
        ToolStatus::Success
    };

    let content = match result["content"].as_array() {
        Some(items) => items.iter().map(content_block).collect(),
        None => vec![ContentBlock::text(result.to_string())],
    };
    ToolOutput { status, content }
}

fn content_block(item: &Value) -> ContentBlock {
    match item["type"].as_str() {
        Some("text") => ContentBlock::text(item["text"].as_str().unwrap_or_default()),
        Some("image") => {
            let format = item["mimeType"]
                .as_str()
                .and_then(|m| m.strip_prefix("image/"))
                .unwrap_or("png")
                .to_string();
            match item["data"].as_str().map(|d| STANDARD.decode(d)) {
                Some(Ok(data)) => ContentBlock::Image { format, data },
                _ => ContentBlock::text("[image with undecodable data]"),
            }
        }
        _ => ContentBlock::text(item.to_string()),
    }
}
