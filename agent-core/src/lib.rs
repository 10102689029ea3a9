//! Agent core: the pieces the Agent Host orchestrates.
//!
//! - [`message`]: chat messages, tool calls, tool definitions.
//! - [`conversation`]: event-sourced conversation aggregate.
//! - [`llm`]: provider abstraction with Ollama- and OpenAI-style streaming adapters.
//! - [`agent`]: ReAct loop emitting an [`agent::AgentEvent`] stream.
//! - [`tools_client`]: HTTP + SSE client for the Tools Provider.

pub mod agent;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod message;
pub mod tools_client;

pub use agent::{
    AgentEvent, AgentLoop, RunContext, ToolCallExecutor, ToolExecutionRequest,
    ToolExecutionResult,
};
pub use conversation::{
    Conversation, ConversationError, ConversationEvent, ConversationState, ConversationStatus,
    MessageStatus, StoredMessage,
};
pub use error::ErrorKind;
pub use llm::{
    ChunkStream, LlmConfig, LlmError, LlmProvider, LlmProviderFactory, LlmResponse, MockLlm,
    ProviderKind, StreamChunk,
};
pub use message::{ChatMessage, ChatRole, ToolCall, ToolDefinition};
pub use tools_client::{ProviderToolExecutor, ToolCallResponse, ToolManifest, ToolProviderClient};
