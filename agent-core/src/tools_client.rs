//! HTTP + SSE client for the Tools Provider, with the end user's bearer token
//! propagated on every request.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::agent::{ToolCallExecutor, ToolExecutionRequest, ToolExecutionResult};
use crate::message::ToolDefinition;

/// One catalog entry the caller may invoke.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolManifest {
    pub tool_id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub source_id: String,
    pub source_path: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ToolManifest {
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolCallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub arguments: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ToolCallResponse {
    #[serde(default)]
    pub tool_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub upstream_status: Option<u16>,
}

/// Updates pushed over the `/agent/sse` subscription.
#[derive(Clone, Debug)]
pub enum ToolListUpdate {
    Connected,
    Tools(Vec<ToolManifest>),
    Heartbeat,
    Error(String),
}

#[derive(Debug, Error)]
pub enum ToolClientError {
    #[error("tools provider request failed: {0}")]
    Transport(String),
    #[error("tools provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

pub struct ToolProviderClient {
    base_url: String,
    http: reqwest::Client,
}

impl ToolProviderClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// `GET /agent/tools`: the caller's access-filtered manifest.
    pub async fn list_tools(&self, bearer: &str) -> Result<Vec<ToolManifest>, ToolClientError> {
        let response = self
            .http
            .get(format!("{}/agent/tools", self.base_url))
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| ToolClientError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ToolClientError::Transport(e.to_string()))?;
        if status != 200 {
            return Err(ToolClientError::Status { status, body });
        }
        serde_json::from_str(&body).map_err(|e| ToolClientError::Decode(e.to_string()))
    }

    /// `POST /agent/tools/call`. Tool-level failures come back as a normal
    /// response with `status = "failed"`; only transport/auth problems error.
    pub async fn call_tool(
        &self,
        bearer: &str,
        request: &ToolCallRequest,
    ) -> Result<ToolCallResponse, ToolClientError> {
        let response = self
            .http
            .post(format!("{}/agent/tools/call", self.base_url))
            .bearer_auth(bearer)
            .json(request)
            .send()
            .await
            .map_err(|e| ToolClientError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ToolClientError::Transport(e.to_string()))?;
        // Error statuses still carry the structured body when the provider
        // produced one (403 forbidden, 400 validation, ...).
        match serde_json::from_str::<ToolCallResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if status != 200 => Err(ToolClientError::Status { status, body }),
            Err(e) => Err(ToolClientError::Decode(e.to_string())),
        }
    }

    /// Opens the `/agent/sse` subscription once per session. Parsed events are
    /// forwarded on the returned channel until the stream or receiver closes.
    pub fn subscribe(&self, bearer: &str) -> mpsc::Receiver<ToolListUpdate> {
        let (tx, rx) = mpsc::channel(16);
        let url = format!("{}/agent/sse", self.base_url);
        let http = self.http.clone();
        let bearer = bearer.to_string();
        tokio::spawn(async move {
            let response = match http.get(&url).bearer_auth(&bearer).send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    let _ = tx
                        .send(ToolListUpdate::Error(format!(
                            "subscription rejected: {}",
                            r.status()
                        )))
                        .await;
                    return;
                }
                Err(e) => {
                    let _ = tx.send(ToolListUpdate::Error(e.to_string())).await;
                    return;
                }
            };
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            let mut event_name = String::new();
            while let Some(piece) = bytes.next().await {
                let piece = match piece {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = tx.send(ToolListUpdate::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&piece));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim_end();
                    if let Some(name) = line.strip_prefix("event: ") {
                        event_name = name.to_string();
                    } else if let Some(data) = line.strip_prefix("data: ") {
                        let update = match event_name.as_str() {
                            "connected" => Some(ToolListUpdate::Connected),
                            "heartbeat" => Some(ToolListUpdate::Heartbeat),
                            "error" => Some(ToolListUpdate::Error(data.to_string())),
                            "tool_list" => serde_json::from_str::<Vec<ToolManifest>>(data)
                                .ok()
                                .map(ToolListUpdate::Tools),
                            _ => None,
                        };
                        if let Some(update) = update {
                            if tx.send(update).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        rx
    }
}

/// Bridges the agent loop's executor capability onto the Tools Provider,
/// resolving tool names to catalog ids through the session's manifest.
pub struct ProviderToolExecutor {
    client: Arc<ToolProviderClient>,
    bearer: String,
    manifest: tokio::sync::RwLock<Vec<ToolManifest>>,
}

impl ProviderToolExecutor {
    pub fn new(client: Arc<ToolProviderClient>, bearer: impl Into<String>) -> Self {
        Self {
            client,
            bearer: bearer.into(),
            manifest: tokio::sync::RwLock::new(Vec::new()),
        }
    }

    pub async fn set_manifest(&self, manifest: Vec<ToolManifest>) {
        *self.manifest.write().await = manifest;
    }

    async fn resolve_tool_id(&self, name: &str) -> Option<String> {
        self.manifest
            .read()
            .await
            .iter()
            .find(|t| t.name == name || t.tool_id == name)
            .map(|t| t.tool_id.clone())
    }
}

#[async_trait]
impl ToolCallExecutor for ProviderToolExecutor {
    async fn execute(&self, request: ToolExecutionRequest) -> Result<ToolExecutionResult, String> {
        let tool_id = self.resolve_tool_id(&request.name).await;
        let call = ToolCallRequest {
            tool_id,
            name: Some(request.name.clone()),
            arguments: request.arguments,
        };
        let response = self
            .client
            .call_tool(&self.bearer, &call)
            .await
            .map_err(|e| e.to_string())?;
        Ok(ToolExecutionResult {
            success: response.status == "completed",
            result: response.result,
            error: response.error,
            execution_time_ms: response.execution_time_ms,
        })
    }
}
