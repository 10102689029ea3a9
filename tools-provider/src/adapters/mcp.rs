//! MCP manifest ingestion: parse an `mcp.json`-style manifest, start (or
//! connect to) the server, list its tools, and emit definitions whose
//! execution profiles route to the internal MCP executor.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AdapterError, IngestionResult, SourceAdapter};
use crate::domain::tool_definition::inventory_hash;
use crate::domain::{AuthConfig, ExecutionProfile, ToolDefinition};
use crate::mcp::{HttpTransport, McpRegistry, McpTransport, StdioTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageRegistry {
    Pypi,
    Npm,
    Docker,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpPackage {
    pub registry: PackageRegistry,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
}

impl McpPackage {
    /// Launch command for the package's runtime.
    pub fn command(&self) -> (String, Vec<String>) {
        let versioned = match &self.version {
            Some(version) => format!("{}=={}", self.name, version),
            None => self.name.clone(),
        };
        let mut args: Vec<String>;
        let program = match self.registry {
            PackageRegistry::Pypi => {
                args = vec![versioned];
                "uvx"
            }
            PackageRegistry::Npm => {
                let spec = match &self.version {
                    Some(version) => format!("{}@{}", self.name, version),
                    None => self.name.clone(),
                };
                args = vec!["-y".into(), spec];
                "npx"
            }
            PackageRegistry::Docker => {
                args = vec!["run".into(), "-i".into(), "--rm".into(), self.name.clone()];
                "docker"
            }
        };
        args.extend(self.args.iter().cloned());
        (program.to_string(), args)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    #[default]
    Stdio,
    StreamableHttp,
    Sse,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransportSpec {
    #[serde(rename = "type", default)]
    pub transport_type: TransportType,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub packages: Vec<McpPackage>,
    #[serde(default)]
    pub transport: TransportSpec,
}

pub struct McpAdapter {
    http: reqwest::Client,
    registry: Arc<McpRegistry>,
}

impl McpAdapter {
    pub fn new(registry: Arc<McpRegistry>) -> Self {
        Self {
            http: reqwest::Client::new(),
            registry,
        }
    }

    async fn fetch_manifest(
        &self,
        url: &str,
        auth: &AuthConfig,
    ) -> Result<McpManifest, AdapterError> {
        let mut request = self.http.get(url);
        if let Some(token) = auth.bearer_token() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::Fetch(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AdapterError::Fetch(e.to_string()))?;
        if status != 200 {
            return Err(AdapterError::Fetch(format!(
                "manifest endpoint returned {}",
                status
            )));
        }
        serde_json::from_str(&body).map_err(|e| AdapterError::Parse(e.to_string()))
    }

    /// Builds and initializes the transport the manifest asks for.
    async fn connect(
        &self,
        manifest: &McpManifest,
        auth: &AuthConfig,
    ) -> Result<Arc<dyn McpTransport>, AdapterError> {
        let transport: Arc<dyn McpTransport> = match manifest.transport.transport_type {
            TransportType::Stdio => {
                let package = manifest.packages.first().ok_or_else(|| {
                    AdapterError::Parse("stdio transport requires at least one package".into())
                })?;
                let (program, args) = package.command();
                let env: Vec<(String, String)> = package
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Arc::new(StdioTransport::spawn(&program, &args, &env)?)
            }
            TransportType::StreamableHttp | TransportType::Sse => {
                let url = manifest.transport.url.as_ref().ok_or_else(|| {
                    AdapterError::Parse("http transport requires a url".into())
                })?;
                Arc::new(HttpTransport::new(url.clone(), auth.bearer_token()))
            }
        };
        transport.initialize().await?;
        Ok(transport)
    }
}

#[async_trait]
impl SourceAdapter for McpAdapter {
    async fn fetch_and_normalize(
        &self,
        source_id: &str,
        url: &str,
        auth: &AuthConfig,
        _default_audience: &str,
    ) -> Result<IngestionResult, AdapterError> {
        let manifest = self.fetch_manifest(url, auth).await?;
        // Replace any previous session for this source.
        self.registry.remove(source_id).await;
        let transport = self.connect(&manifest, auth).await?;
        let mcp_tools = transport.list_tools().await?;
        self.registry.insert(source_id, transport);

        let mut result = IngestionResult {
            source_version: manifest.version.clone(),
            ..Default::default()
        };
        for tool in mcp_tools {
            result.tools.push(ToolDefinition {
                description: tool
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("MCP tool {}", tool.name)),
                input_schema: if tool.input_schema.is_null() {
                    serde_json::json!({"type": "object", "properties": {}})
                } else {
                    tool.input_schema.clone()
                },
                source_path: tool.name.clone(),
                execution_profile: ExecutionProfile::mcp(tool.name.clone()),
                tags: vec!["mcp".into()],
                version: manifest.version.clone(),
                name: tool.name,
            });
        }
        result.inventory_hash = inventory_hash(&result.tools);
        Ok(result)
    }
}
