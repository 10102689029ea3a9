//! Ollama-style adapter: NDJSON chat stream over `/api/chat`.
//!
//! Ollama sends tool calls inside ordinary chunks before the terminal
//! `done: true` line, so the adapter accumulates them across chunks and
//! attaches the full set to the terminal [`StreamChunk`].

use futures_util::StreamExt;
use serde_json::{json, Value};

use super::{
    parse_arguments, ChunkStream, LlmConfig, LlmError, LlmProvider, LlmResponse, LlmUsage,
    ProviderKind, StreamChunk,
};
use crate::message::{ChatMessage, ChatRole, ToolCall, ToolDefinition};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    config: LlmConfig,
    base_url: String,
    http: reqwest::Client,
    model_override: std::sync::RwLock<Option<String>>,
}

impl OllamaProvider {
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
        Self {
            config,
            base_url,
            http,
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
                                    "function": {
                                        "name": c.name,
                                        "arguments": c.arguments,
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                obj
            })
            .collect()
    }

    fn payload(&self, messages: &[ChatMessage], tools: &[ToolDefinition], stream: bool) -> Value {
        let mut options = json!({
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
        });
        if !self.config.stop.is_empty() {
            options["stop"] = json!(self.config.stop);
        }
        let mut payload = json!({
            "model": self.current_model(),
            "messages": Self::wire_messages(messages),
            "stream": stream,
            "options": options,
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(
                tools.iter().map(ToolDefinition::to_function_format).collect(),
            );
        }
        payload
    }

    fn parse_tool_calls(raw: &[Value]) -> Vec<ToolCall> {
        raw.iter()
            .map(|tc| {
                let func = tc.get("function").cloned().unwrap_or(Value::Null);
                ToolCall {
                    call_id: tc
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    name: func
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: parse_arguments(func.get("arguments").unwrap_or(&Value::Null)),
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl LlmProvider for OllamaProvider {
    fn provider_type(&self) -> ProviderKind {
        ProviderKind::Ollama
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
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&self.payload(messages, tools, false))
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(LlmError::from_reqwest)?;
        if status != 200 {
            return Err(LlmError::from_status(status, &body));
        }
        let data: Value =
            serde_json::from_str(&body).map_err(|e| LlmError::Unknown(e.to_string()))?;
        let message = data.get("message").cloned().unwrap_or(Value::Null);
        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|raw| Self::parse_tool_calls(raw))
            .unwrap_or_default();
        let finish_reason = if tool_calls.is_empty() {
            "stop"
        } else {
            "tool_calls"
        };
        Ok(LlmResponse {
            content: message
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            tool_calls,
            finish_reason: Some(finish_reason.to_string()),
            usage: data.get("eval_count").and_then(|v| v.as_u64()).map(|n| LlmUsage {
                completion_tokens: n as u32,
                total_tokens: n as u32,
                ..Default::default()
            }),
        })
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChunkStream, LlmError> {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&self.payload(messages, tools, true))
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, &body));
        }

        let model = self.current_model();
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<StreamChunk, LlmError>>(64);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            let mut accumulated_calls: Vec<Value> = Vec::new();

            while let Some(piece) = bytes.next().await {
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
                    if line.is_empty() {
                        continue;
                    }
                    let chunk: Value = match serde_json::from_str(line) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(model = %model, "unparseable stream line: {}", e);
                            continue;
                        }
                    };
                    if let Some(calls) = chunk
                        .pointer("/message/tool_calls")
                        .and_then(|v| v.as_array())
                    {
                        accumulated_calls.extend(calls.iter().cloned());
                    }
                    if chunk.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
                        let tool_calls = Self::parse_tool_calls(&accumulated_calls);
                        let finish_reason = if tool_calls.is_empty() {
                            "stop"
                        } else {
                            "tool_calls"
                        };
                        let _ = tx
                            .send(Ok(StreamChunk {
                                content: String::new(),
                                tool_calls,
                                done: true,
                                finish_reason: Some(finish_reason.to_string()),
                            }))
                            .await;
                        return;
                    }
                    let content = chunk
                        .pointer("/message/content")
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
            tracing::warn!(model = %model, "stream ended without done marker");
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> bool {
        let response = match self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            _ => return false,
        };
        let data: Value = match response.json().await {
            Ok(v) => v,
            Err(_) => return false,
        };
        let model = self.current_model();
        let family = model.split(':').next().unwrap_or(&model);
        data.get("models")
            .and_then(|v| v.as_array())
            .map(|models| {
                models.iter().any(|m| {
                    m.get("name")
                        .and_then(|n| n.as_str())
                        .map(|name| name == model || name.starts_with(family))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_include_tool_calls_only_for_assistant() {
        let messages = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall {
                    call_id: "c1".into(),
                    name: "math:add".into(),
                    arguments: json!({"a": 1}),
                }],
            ),
            ChatMessage::tool("c1", "{\"sum\":3}"),
        ];
        let wire = OllamaProvider::wire_messages(&messages);
        assert!(wire[0].get("tool_calls").is_none());
        assert_eq!(wire[1]["tool_calls"][0]["function"]["name"], "math:add");
        assert_eq!(wire[2]["role"], "tool");
    }

    #[test]
    fn parse_tool_calls_generates_ids_and_tolerates_bad_arguments() {
        let raw = vec![
            json!({"function": {"name": "math:add", "arguments": {"a": 2}}}),
            json!({"function": {"name": "broken", "arguments": "{not json"}}),
        ];
        let calls = OllamaProvider::parse_tool_calls(&raw);
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].call_id.is_empty());
        assert_eq!(calls[0].arguments, json!({"a": 2}));
        assert_eq!(calls[1].arguments, json!({}));
    }

    #[test]
    fn payload_carries_model_stream_flag_and_tools() {
        let provider = OllamaProvider::new(LlmConfig {
            model: "llama3.2:3b".into(),
            ..Default::default()
        });
        let tools = vec![ToolDefinition {
            name: "math:add".into(),
            description: "add".into(),
            parameters: json!({"type": "object"}),
        }];
        let payload = provider.payload(&[ChatMessage::user("hi")], &tools, true);
        assert_eq!(payload["model"], "llama3.2:3b");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["tools"][0]["function"]["name"], "math:add");
    }

    #[test]
    fn model_override_round_trip() {
        let provider = OllamaProvider::new(LlmConfig {
            model: "llama3.2:3b".into(),
            ..Default::default()
        });
        assert_eq!(provider.current_model(), "llama3.2:3b");
        provider.set_model_override(Some("mistral:7b".into()));
        assert_eq!(provider.current_model(), "mistral:7b");
        provider.set_model_override(None);
        assert_eq!(provider.current_model(), "llama3.2:3b");
    }
}
