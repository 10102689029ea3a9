//! LLM provider abstraction: one streaming interface over heterogeneous backends.
//!
//! Implementations parse each backend's wire protocol into [`StreamChunk`]s and
//! assemble partial tool-call fragments so consumers only ever see complete
//! calls on the terminal chunk. `MockLlm` scripts responses for tests.

mod mock;
mod ollama;
mod openai;

pub use mock::MockLlm;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::message::{ChatMessage, ToolCall, ToolDefinition};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Ollama,
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            other => Err(format!("unknown provider type: {}", other)),
        }
    }
}

/// Splits a qualified `provider:model` id. A prefix that is not a known
/// provider is treated as part of the model name (Ollama tags contain colons).
pub fn parse_qualified_model(model_id: &str) -> (Option<ProviderKind>, &str) {
    if let Some((prefix, rest)) = model_id.split_once(':') {
        if let Ok(kind) = prefix.parse::<ProviderKind>() {
            return (Some(kind), rest);
        }
    }
    (None, model_id)
}

/// OAuth2 client-credentials gateway in front of the chat API.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Extra per-request key some gateways require, sent as `X-Api-Key`.
    pub api_key: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub timeout: Duration,
    pub stop: Vec<String>,
    pub gateway: Option<GatewayConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            base_url: None,
            api_key: None,
            temperature: 0.7,
            top_p: 0.9,
            timeout: Duration::from_secs(120),
            stop: Vec::new(),
            gateway: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model backend unavailable: {0}")]
    Unavailable(String),
    #[error("model request timed out: {0}")]
    Timeout(String),
    #[error("model authentication failed: {0}")]
    Auth(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("model rate limited: {0}")]
    RateLimited(String),
    #[error("model backend error: {0}")]
    Server(String),
    #[error("unexpected model error: {0}")]
    Unknown(String),
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Timeout(_) => ErrorKind::UpstreamTimeout,
            Self::Auth(_) => ErrorKind::AuthError,
            Self::ModelNotFound(_) => ErrorKind::ModelNotFound,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Server(_) => ErrorKind::ServerError,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Maps a transport-level failure to its kind.
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Unknown(e.to_string())
        }
    }

    /// Maps an HTTP error status plus body to its kind.
    pub(crate) fn from_status(status: u16, body: &str) -> Self {
        let summary: String = body.chars().take(200).collect();
        match status {
            401 | 403 => Self::Auth(summary),
            404 => Self::ModelNotFound(summary),
            429 => Self::RateLimited(summary),
            s if s >= 500 => Self::Server(summary),
            _ if body.to_lowercase().contains("not found") => Self::ModelNotFound(summary),
            _ => Self::Unknown(summary),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Complete response from one chat call.
#[derive(Clone, Debug, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
    pub usage: Option<LlmUsage>,
}

/// One streaming chunk. `done` marks the terminal chunk, which carries the
/// fully assembled `tool_calls` (partial fragments never escape the adapter).
#[derive(Clone, Debug, Default)]
pub struct StreamChunk {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub done: bool,
    pub finish_reason: Option<String>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_type(&self) -> ProviderKind;

    /// Override-aware model name.
    fn current_model(&self) -> String;

    /// Temporarily replaces the configured model; `None` clears the override.
    fn set_model_override(&self, model: Option<String>);

    /// One-shot chat completion.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, LlmError>;

    /// Streaming chat completion. The stream is finite and not restartable.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChunkStream, LlmError>;

    /// Verifies connectivity and, where the backend supports it, that the
    /// configured model is loaded.
    async fn health_check(&self) -> bool;
}

/// Builds providers by kind; used at startup and on qualified model changes.
pub struct LlmProviderFactory {
    base_config: LlmConfig,
    /// When set, every build returns this provider (tests, single-backend
    /// deployments with a preconstructed client).
    fixed: Option<Arc<dyn LlmProvider>>,
}

impl LlmProviderFactory {
    pub fn new(base_config: LlmConfig) -> Self {
        Self {
            base_config,
            fixed: None,
        }
    }

    pub fn fixed(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            base_config: LlmConfig::default(),
            fixed: Some(provider),
        }
    }

    pub fn build(&self, kind: ProviderKind, model: Option<&str>) -> Arc<dyn LlmProvider> {
        if let Some(fixed) = &self.fixed {
            return Arc::clone(fixed);
        }
        let mut config = self.base_config.clone();
        if let Some(m) = model {
            config.model = m.to_string();
        }
        match kind {
            ProviderKind::Ollama => Arc::new(OllamaProvider::new(config)),
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(config)),
        }
    }

    /// Resolves a model-change request: a qualified `provider:model` id builds a
    /// fresh provider; a bare model id overrides the current provider's model.
    pub fn resolve(
        &self,
        model_id: &str,
        current: &Arc<dyn LlmProvider>,
    ) -> Arc<dyn LlmProvider> {
        match parse_qualified_model(model_id) {
            (Some(kind), model) => self.build(kind, Some(model)),
            (None, model) => {
                current.set_model_override(Some(model.to_string()));
                Arc::clone(current)
            }
        }
    }
}

/// Parses a tool-call arguments payload that providers send as a JSON string.
/// Malformed JSON yields an empty object rather than aborting the turn.
pub(crate) fn parse_arguments(raw: &serde_json::Value) -> serde_json::Value {
    match raw {
        serde_json::Value::String(s) => {
            serde_json::from_str(s).unwrap_or_else(|_| serde_json::json!({}))
        }
        serde_json::Value::Object(_) => raw.clone(),
        _ => serde_json::json!({}),
    }
}
