//! Scripted LLM for tests: returns queued responses in order, chunking the
//! content so streaming consumers exercise their accumulation paths.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    ChunkStream, LlmError, LlmProvider, LlmResponse, ProviderKind, StreamChunk,
};
use crate::message::{ChatMessage, ToolDefinition};

pub struct MockLlm {
    responses: Mutex<std::collections::VecDeque<Result<LlmResponse, LlmError>>>,
    model: std::sync::RwLock<String>,
    /// Captured prompts, one per call, for assertions.
    pub calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl MockLlm {
    pub fn new(responses: Vec<Result<LlmResponse, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            model: std::sync::RwLock::new("mock-model".into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A mock that always answers with fixed text.
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(vec![Ok(LlmResponse {
            content: content.into(),
            ..Default::default()
        })])
    }

    async fn next_response(&self, messages: &[ChatMessage]) -> Result<LlmResponse, LlmError> {
        self.calls.lock().await.push(messages.to_vec());
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Unknown("mock exhausted".into())))
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn provider_type(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn current_model(&self) -> String {
        self.model.read().map(|m| m.clone()).unwrap_or_default()
    }

    fn set_model_override(&self, model: Option<String>) {
        if let Ok(mut m) = self.model.write() {
            *m = model.unwrap_or_else(|| "mock-model".into());
        }
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<LlmResponse, LlmError> {
        self.next_response(messages).await
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChunkStream, LlmError> {
        let response = self.next_response(messages).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            // Stream content in small pieces, then the terminal chunk.
            for piece in response
                .content
                .as_bytes()
                .chunks(4)
                .map(|c| String::from_utf8_lossy(c).into_owned())
            {
                if tx
                    .send(Ok(StreamChunk {
                        content: piece,
                        ..Default::default()
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let finish_reason = if response.tool_calls.is_empty() {
                Some("stop".to_string())
            } else {
                Some("tool_calls".to_string())
            };
            let _ = tx
                .send(Ok(StreamChunk {
                    content: String::new(),
                    tool_calls: response.tool_calls,
                    done: true,
                    finish_reason,
                }))
                .await;
        });
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> bool {
        true
    }
}
