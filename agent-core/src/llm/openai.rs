//! OpenAI-style adapter: SSE chat completions with per-index tool-call deltas.
//!
//! Function-calling protocols stream `function.name` and `function.arguments`
//! as string deltas keyed by tool-call ordinal; the adapter accumulates them
//! and yields the assembled calls on the terminal chunk. Optionally
//! authenticates through an OAuth2 client-credentials gateway.

use std::collections::BTreeMap;
use std::time::Instant;

use futures_util::StreamExt;
use serde_json::{json, Value};

use super::{
    parse_arguments, ChunkStream, GatewayConfig, LlmConfig, LlmError, LlmProvider, LlmResponse,
    LlmUsage, ProviderKind, StreamChunk,
};
use crate::message::{ChatMessage, ChatRole, ToolCall, ToolDefinition};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// Refresh gateway tokens this long before they expire.
const TOKEN_REFRESH_MARGIN_SECS: u64 = 30;

struct CachedToken {
    access_token: String,
    fetched_at: Instant,
    expires_in_secs: u64,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        let lifetime = self
            .expires_in_secs
            .saturating_sub(TOKEN_REFRESH_MARGIN_SECS);
        self.fetched_at.elapsed().as_secs() < lifetime
    }
}

/// Client-credentials token source for a gateway-fronted chat API.
struct GatewayAuth {
    config: GatewayConfig,
    http: reqwest::Client,
    cached: tokio::sync::Mutex<Option<CachedToken>>,
}

impl GatewayAuth {
    fn new(config: GatewayConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    async fn bearer(&self) -> Result<String, LlmError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh() {
                return Ok(token.access_token.clone());
            }
        }
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(LlmError::from_reqwest)?;
        if status != 200 {
            return Err(LlmError::Auth(format!(
                "gateway token endpoint returned {}",
                status
            )));
        }
        let data: Value =
            serde_json::from_str(&body).map_err(|e| LlmError::Auth(e.to_string()))?;
        let access_token = data
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LlmError::Auth("gateway token response missing access_token".into()))?
            .to_string();
        let expires_in_secs = data.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(300);
        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            fetched_at: Instant::now(),
            expires_in_secs,
        });
        Ok(access_token)
    }
}

/// Partial tool call accumulated across stream deltas, keyed by ordinal.
#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

fn absorb_tool_call_deltas(acc: &mut BTreeMap<u64, PartialToolCall>, deltas: &[Value]) {
    for delta in deltas {
        let index = delta.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
        let entry = acc.entry(index).or_default();
        if let Some(id) = delta.get("id").and_then(|v| v.as_str()) {
            if !id.is_empty() {
                entry.id = id.to_string();
            }
        }
        if let Some(func) = delta.get("function") {
            if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
                entry.name.push_str(name);
            }
            if let Some(args) = func.get("arguments").and_then(|v| v.as_str()) {
                entry.arguments.push_str(args);
            }
        }
    }
}

fn assemble_tool_calls(acc: BTreeMap<u64, PartialToolCall>) -> Vec<ToolCall> {
    acc.into_values()
        .map(|partial| ToolCall {
            call_id: if partial.id.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                partial.id
            },
            name: partial.name,
            arguments: parse_arguments(&Value::String(partial.arguments)),
        })
        .collect()
}

pub struct OpenAiProvider {
    config: LlmConfig,
    base_url: String,
    http: reqwest::Client,
    gateway: Option<GatewayAuth>,
    model_override: std::sync::RwLock<Option<String>>,
}

impl OpenAiProvider {
    pub fn new(config: LlmConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        let gateway = config
            .gateway
            .clone()
            .map(|g| GatewayAuth::new(g, http.clone()));
        Self {
            config,
            base_url,
            http,
            gateway,
            model_override: std::sync::RwLock::new(None),
        }
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let mut obj = json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                });
                if m.role == ChatRole::Assistant && !m.tool_calls.is_empty() {
                    obj["tool_calls"] = Value::Array(
                        m.tool_calls
                            .iter()
                            .map(|c| {
                                json!({
                                    "id": c.call_id,
                                    "type": "function",
                                    "function": {
                                        "name": c.name,
                                        // Arguments ride the wire as JSON strings.
                                        "arguments": c.arguments.to_string(),
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                if m.role == ChatRole::Tool {
                    if let Some(call_id) = &m.tool_call_id {
                        obj["tool_call_id"] = json!(call_id);
                    }
                }
                obj
            })
            .collect()
    }

    fn payload(&self, messages: &[ChatMessage], tools: &[ToolDefinition], stream: bool) -> Value {
        let mut payload = json!({
            "model": self.current_model(),
            "messages": Self::wire_messages(messages),
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "stream": stream,
        });
        if !self.config.stop.is_empty() {
            payload["stop"] = json!(self.config.stop);
        }
        if !tools.is_empty() {
            payload["tools"] = Value::Array(
                tools.iter().map(ToolDefinition::to_function_format).collect(),
            );
            payload["tool_choice"] = json!("auto");
        }
        payload
    }

    async fn request(&self, payload: &Value) -> Result<reqwest::Response, LlmError> {
        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(payload);
        if let Some(gateway) = &self.gateway {
            request = request.bearer_auth(gateway.bearer().await?);
            if let Some(key) = &gateway.config.api_key {
                request = request.header("X-Api-Key", key);
            }
        } else if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        request.send().await.map_err(LlmError::from_reqwest)
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_type(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn current_model(&self) -> String {
        self.model_override
            .read()
            .ok()
            .and_then(|m| m.clone())
            .unwrap_or_else(|| self.config.model.clone())
    }

    fn set_model_override(&self, model: Option<String>) {
        if let Ok(mut m) = self.model_override.write() {
            *m = model;
        }
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, LlmError> {
        let response = self.request(&self.payload(messages, tools, false)).await?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(LlmError::from_reqwest)?;
        if status != 200 {
            return Err(LlmError::from_status(status, &body));
        }
        let data: Value =
            serde_json::from_str(&body).map_err(|e| LlmError::Unknown(e.to_string()))?;
        let message = data
            .pointer("/choices/0/message")
            .cloned()
            .unwrap_or(Value::Null);
        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|raw| {
                raw.iter()
                    .map(|tc| ToolCall {
                        call_id: tc
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                        name: tc
                            .pointer("/function/name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: parse_arguments(
                            tc.pointer("/function/arguments").unwrap_or(&Value::Null),
                        ),
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(LlmResponse {
            content: message
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            finish_reason: data
                .pointer("/choices/0/finish_reason")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            usage: data.get("usage").map(|u| LlmUsage {
                prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                completion_tokens: u
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            }),
            tool_calls,
        })
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChunkStream, LlmError> {
        let response = self.request(&self.payload(messages, tools, true)).await?;
        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, &body));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<StreamChunk, LlmError>>(64);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            let mut acc: BTreeMap<u64, PartialToolCall> = BTreeMap::new();
            let mut finish_reason: Option<String> = None;

            'outer: while let Some(piece) = bytes.next().await {
                let piece = match piece {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::from_reqwest(e))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&piece));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    let chunk: Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!("unparseable SSE chunk: {}", e);
                            continue;
                        }
                    };
                    if let Some(reason) = chunk
                        .pointer("/choices/0/finish_reason")
                        .and_then(|v| v.as_str())
                    {
                        finish_reason = Some(reason.to_string());
                    }
                    let delta = chunk.pointer("/choices/0/delta").cloned().unwrap_or(Value::Null);
                    if let Some(deltas) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                        absorb_tool_call_deltas(&mut acc, deltas);
                    }
                    let content = delta
                        .get("content")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    if !content.is_empty()
                        && tx
                            .send(Ok(StreamChunk {
                                content: content.to_string(),
                                ..Default::default()
                            }))
                            .await
                            .is_err()
                    {
                        return;
                    }
                }
            }

            let tool_calls = assemble_tool_calls(acc);
            let finish_reason = finish_reason.or_else(|| {
                Some(if tool_calls.is_empty() { "stop" } else { "tool_calls" }.to_string())
            });
            let _ = tx
                .send(Ok(StreamChunk {
                    content: String::new(),
                    tool_calls,
                    done: true,
                    finish_reason,
                }))
                .await;
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> bool {
        let mut request = self.http.get(format!("{}/models", self.base_url));
        if let Some(gateway) = &self.gateway {
            match gateway.bearer().await {
                Ok(token) => request = request.bearer_auth(token),
                Err(_) => return false,
            }
        } else if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        matches!(request.send().await, Ok(r) if r.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_accumulate_by_index() {
        let mut acc = BTreeMap::new();
        absorb_tool_call_deltas(
            &mut acc,
            &[json!({"index": 0, "id": "call_1", "function": {"name": "math:", "arguments": "{\"a\""}})],
        );
        absorb_tool_call_deltas(
            &mut acc,
            &[
                json!({"index": 0, "function": {"name": "add", "arguments": ": 2}"}}),
                json!({"index": 1, "id": "call_2", "function": {"name": "echo", "arguments": "{}"}}),
            ],
        );
        let calls = assemble_tool_calls(acc);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_id, "call_1");
        assert_eq!(calls[0].name, "math:add");
        assert_eq!(calls[0].arguments, json!({"a": 2}));
        assert_eq!(calls[1].name, "echo");
    }

    #[test]
    fn malformed_accumulated_arguments_become_empty_object() {
        let mut acc = BTreeMap::new();
        absorb_tool_call_deltas(
            &mut acc,
            &[json!({"index": 0, "id": "c", "function": {"name": "f", "arguments": "{oops"}})],
        );
        let calls = assemble_tool_calls(acc);
        assert_eq!(calls[0].arguments, json!({}));
    }

    #[test]
    fn wire_messages_serialize_arguments_as_strings() {
        let messages = vec![
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall {
                    call_id: "c1".into(),
                    name: "math:add".into(),
                    arguments: json!({"a": 2}),
                }],
            ),
            ChatMessage::tool("c1", "{\"sum\":4}"),
        ];
        let wire = OpenAiProvider::wire_messages(&messages);
        let args = wire[0]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        assert_eq!(serde_json::from_str::<Value>(args).unwrap(), json!({"a": 2}));
        assert_eq!(wire[1]["tool_call_id"], "c1");
    }

    #[test]
    fn payload_includes_tool_choice_only_with_tools() {
        let provider = OpenAiProvider::new(LlmConfig {
            model: "gpt-4o".into(),
            ..Default::default()
        });
        let bare = provider.payload(&[ChatMessage::user("hi")], &[], true);
        assert!(bare.get("tool_choice").is_none());
        let tools = vec![ToolDefinition {
            name: "t".into(),
            description: String::new(),
            parameters: json!({}),
        }];
        let with_tools = provider.payload(&[ChatMessage::user("hi")], &tools, true);
        assert_eq!(with_tools["tool_choice"], "auto");
    }

    #[test]
    fn cached_token_freshness_honors_margin() {
        let token = CachedToken {
            access_token: "t".into(),
            fetched_at: Instant::now(),
            expires_in_secs: 3600,
        };
        assert!(token.is_fresh());
        let expiring = CachedToken {
            access_token: "t".into(),
            fetched_at: Instant::now(),
            expires_in_secs: TOKEN_REFRESH_MARGIN_SECS,
        };
        assert!(!expiring.is_fresh());
    }
}
