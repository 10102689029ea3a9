//! Source adapters: fetch an upstream descriptor and emit normalized tool
//! definitions with execution profiles.

pub mod mcp;
pub mod openapi;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{AuthConfig, SourceType, ToolDefinition};

pub use mcp::McpAdapter;
pub use openapi::OpenApiAdapter;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("descriptor fetch failed: {0}")]
    Fetch(String),
    #[error("unsupported descriptor: {0}")]
    Unsupported(String),
    #[error("descriptor parse failed: {0}")]
    Parse(String),
    #[error("MCP error: {0}")]
    Mcp(#[from] crate::mcp::McpError),
}

/// Result of one ingestion pass over a source descriptor.
#[derive(Debug, Default)]
pub struct IngestionResult {
    pub tools: Vec<ToolDefinition>,
    pub inventory_hash: String,
    pub warnings: Vec<String>,
    pub source_version: Option<String>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetches the descriptor at `url` and normalizes it into tool definitions.
    async fn fetch_and_normalize(
        &self,
        source_id: &str,
        url: &str,
        auth: &AuthConfig,
        default_audience: &str,
    ) -> Result<IngestionResult, AdapterError>;
}

/// Selects the adapter for a source type.
pub struct AdapterFactory {
    openapi: std::sync::Arc<OpenApiAdapter>,
    mcp: std::sync::Arc<McpAdapter>,
}

impl AdapterFactory {
    pub fn new(openapi: std::sync::Arc<OpenApiAdapter>, mcp: std::sync::Arc<McpAdapter>) -> Self {
        Self { openapi, mcp }
    }

    pub fn for_source_type(&self, source_type: SourceType) -> std::sync::Arc<dyn SourceAdapter> {
        match source_type {
            SourceType::Openapi => self.openapi.clone(),
            SourceType::Mcp => self.mcp.clone(),
        }
    }
}
