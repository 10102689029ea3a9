//! Normalized tool definition produced by source adapters and carried by the
//! `SourceTool` aggregate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::execution_profile::ExecutionProfile;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema (Draft-7) for the tool's arguments.
    pub input_schema: Value,
    /// Original path (or MCP tool name) in the source descriptor.
    pub source_path: String,
    pub execution_profile: ExecutionProfile,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl ToolDefinition {
    /// Truncated SHA-256 of the canonical serialization, used for change
    /// detection during inventory sync.
    pub fn definition_hash(&self) -> String {
        let canonical = canonical_json(&serde_json::to_value(self).unwrap_or(Value::Null));
        let digest = Sha256::digest(canonical.as_bytes());
        hex_prefix(&digest, 16)
    }
}

/// Stable digest over a set of definitions, order-independent.
pub fn inventory_hash(definitions: &[ToolDefinition]) -> String {
    let mut entries: Vec<String> = definitions
        .iter()
        .map(|d| format!("{}:{}", d.name, d.definition_hash()))
        .collect();
    entries.sort();
    let digest = Sha256::digest(entries.join("\n").as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// Serializes with object keys sorted so hashing is deterministic.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}
