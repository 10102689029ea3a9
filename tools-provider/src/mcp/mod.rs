//! MCP transports: JSON-RPC over a spawned subprocess (stdio) or HTTP.
//!
//! Sessions perform the MCP handshake (`initialize`, then
//! `notifications/initialized`) before `tools/list` / `tools/call`.

pub mod http;
pub mod stdio;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const CLIENT_NAME: &str = "tools-provider";

#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to start MCP server: {0}")]
    Spawn(String),
    #[error("MCP transport error: {0}")]
    Transport(String),
    #[error("MCP protocol error: {0}")]
    Protocol(String),
    #[error("MCP request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// One tool reported by `tools/list`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Performs the initialize handshake. Must be called once before use.
    async fn initialize(&self) -> Result<(), McpError>;

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError>;

    /// Invokes `tools/call`; returns the raw result value.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError>;

    async fn shutdown(&self);
}

pub(crate) fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "clientInfo": { "name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION") },
    })
}

pub(crate) fn parse_tools_list(result: &Value) -> Result<Vec<McpToolInfo>, McpError> {
    let tools = result
        .get("tools")
        .and_then(|v| v.as_array())
        .ok_or_else(|| McpError::Protocol("tools/list result missing tools array".into()))?;
    tools
        .iter()
        .map(|t| {
            serde_json::from_value(t.clone())
                .map_err(|e| McpError::Protocol(format!("malformed tool entry: {}", e)))
        })
        .collect()
}

/// Live MCP sessions by source id; the executor dispatches
/// `ExecutionMode::Mcp` calls through here.
#[derive(Default)]
pub struct McpRegistry {
    sessions: DashMap<String, Arc<dyn McpTransport>>,
}

impl McpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source_id: impl Into<String>, transport: Arc<dyn McpTransport>) {
        self.sessions.insert(source_id.into(), transport);
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn McpTransport>> {
        self.sessions.get(source_id).map(|t| Arc::clone(&t))
    }

    pub async fn remove(&self, source_id: &str) {
        if let Some((_, transport)) = self.sessions.remove(source_id) {
            transport.shutdown().await;
        }
    }

    pub async fn call(
        &self,
        source_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let transport = self
            .get(source_id)
            .ok_or_else(|| McpError::Transport(format!("no MCP session for {}", source_id)))?;
        transport.call_tool(tool_name, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initialize_params_carry_protocol_and_client() {
        let params = initialize_params();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], CLIENT_NAME);
    }

    #[test]
    fn tools_list_parses_input_schema() {
        let result = json!({
            "tools": [
                {"name": "echo", "description": "Echo text", "inputSchema": {"type": "object"}},
                {"name": "bare"},
            ]
        });
        let tools = parse_tools_list(&result).unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].input_schema["type"], "object");
        assert!(tools[1].description.is_none());
    }

    #[test]
    fn tools_list_without_array_is_protocol_error() {
        assert!(matches!(
            parse_tools_list(&json!({"nope": 1})),
            Err(McpError::Protocol(_))
        ));
    }
}
