//! HTTP MCP transport: JSON-RPC requests POSTed to a streamable-HTTP (or SSE)
//! endpoint. Each request is one POST; the server replies with the JSON-RPC
//! response body.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{initialize_params, parse_tools_list, McpError, McpToolInfo, McpTransport};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTransport {
    url: String,
    http: reqwest::Client,
    bearer: Option<String>,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, bearer: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            http,
            bearer,
            next_id: AtomicU64::new(1),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = self
            .http
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }));
        if let Some(bearer) = &self.bearer {
            request = request.bearer_auth(bearer);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout(REQUEST_TIMEOUT)
            } else {
                McpError::Transport(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if status != 200 {
            return Err(McpError::Transport(format!(
                "endpoint returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        // Streamable-HTTP servers may wrap the response in an SSE frame.
        let payload = body
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap_or(body.as_str());
        let message: Value = serde_json::from_str(payload)
            .map_err(|e| McpError::Protocol(format!("malformed response: {}", e)))?;
        if let Some(error) = message.get("error") {
            let detail = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(McpError::Protocol(detail.to_string()));
        }
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let mut request = self.http.post(&self.url).json(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }));
        if let Some(bearer) = &self.bearer {
            request = request.bearer_auth(bearer);
        }
        request
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn initialize(&self) -> Result<(), McpError> {
        self.request("initialize", initialize_params()).await?;
        self.notify("notifications/initialized", json!({})).await
    }

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let result = self.request("tools/list", json!({})).await?;
        parse_tools_list(&result)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.request(
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }

    async fn shutdown(&self) {}
}
