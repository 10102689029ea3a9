//! Execution profile: the recipe for invoking one upstream operation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    SyncHttp,
    AsyncPoll,
    /// Dispatched to the internal MCP executor instead of an HTTP URL.
    Mcp,
}

/// How to poll for completion when `mode = AsyncPoll`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    pub status_url_template: String,
    /// Dot-notation path to the status field in the poll response.
    pub status_field_path: String,
    pub completed_values: Vec<String>,
    pub failed_values: Vec<String>,
    pub result_field_path: String,
    #[serde(default = "PollConfig::default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "PollConfig::default_poll_interval_seconds")]
    pub poll_interval_seconds: f64,
    #[serde(default = "PollConfig::default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "PollConfig::default_max_interval_seconds")]
    pub max_interval_seconds: f64,
}

impl PollConfig {
    fn default_max_poll_attempts() -> u32 {
        60
    }
    fn default_poll_interval_seconds() -> f64 {
        1.0
    }
    fn default_backoff_multiplier() -> f64 {
        1.5
    }
    fn default_max_interval_seconds() -> f64 {
        30.0
    }
}

/// Immutable value object carried inside [`super::ToolDefinition`];
/// re-emitted whole on definition change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub mode: ExecutionMode,
    pub method: String,
    pub url_template: String,
    #[serde(default)]
    pub headers_template: BTreeMap<String, String>,
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default = "ExecutionProfile::default_content_type")]
    pub content_type: String,
    /// output field -> dot-notation path into the upstream response.
    #[serde(default)]
    pub response_mapping: Option<BTreeMap<String, String>>,
    /// Audience for token exchange; empty means the agent token passes through.
    #[serde(default)]
    pub required_audience: String,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default = "ExecutionProfile::default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub poll_config: Option<PollConfig>,
}

impl ExecutionProfile {
    fn default_content_type() -> String {
        "application/json".to_string()
    }

    fn default_timeout_seconds() -> u64 {
        30
    }

    pub fn sync_http(method: impl Into<String>, url_template: impl Into<String>) -> Self {
        Self {
            mode: ExecutionMode::SyncHttp,
            method: method.into(),
            url_template: url_template.into(),
            headers_template: BTreeMap::new(),
            body_template: None,
            content_type: Self::default_content_type(),
            response_mapping: None,
            required_audience: String::new(),
            required_scopes: Vec::new(),
            timeout_seconds: Self::default_timeout_seconds(),
            poll_config: None,
        }
    }

    /// Synthetic profile for tools served over MCP; `url_template` carries the
    /// MCP tool name.
    pub fn mcp(tool_name: impl Into<String>) -> Self {
        Self {
            mode: ExecutionMode::Mcp,
            method: "MCP".into(),
            url_template: tool_name.into(),
            headers_template: BTreeMap::new(),
            body_template: None,
            content_type: Self::default_content_type(),
            response_mapping: None,
            required_audience: String::new(),
            required_scopes: Vec::new(),
            timeout_seconds: Self::default_timeout_seconds(),
            poll_config: None,
        }
    }

    /// Async-poll mode requires a poll config.
    pub fn is_valid(&self) -> bool {
        self.mode != ExecutionMode::AsyncPoll || self.poll_config.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_round_trip_is_identity() {
        let profile = ExecutionProfile {
            mode: ExecutionMode::AsyncPoll,
            method: "POST".into(),
            url_template: "https://api.example.com/jobs".into(),
            headers_template: BTreeMap::from([("X-Trace".into(), "{{ trace_id }}".into())]),
            body_template: Some(r#"{"input": {{ input | tojson }}}"#.into()),
            content_type: "application/json".into(),
            response_mapping: Some(BTreeMap::from([("id".into(), "job.id".into())])),
            required_audience: "jobs-api".into(),
            required_scopes: vec!["jobs:write".into()],
            timeout_seconds: 15,
            poll_config: Some(PollConfig {
                status_url_template: "https://api.example.com/jobs/{{ id }}".into(),
                status_field_path: "status".into(),
                completed_values: vec!["done".into()],
                failed_values: vec!["error".into()],
                result_field_path: "result".into(),
                max_poll_attempts: 10,
                poll_interval_seconds: 0.5,
                backoff_multiplier: 2.0,
                max_interval_seconds: 4.0,
            }),
        };
        let json = serde_json::to_value(&profile).unwrap();
        let back: ExecutionProfile = serde_json::from_value(json).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let profile: ExecutionProfile = serde_json::from_value(serde_json::json!({
            "mode": "sync_http",
            "method": "GET",
            "url_template": "https://api.example.com/users",
        }))
        .unwrap();
        assert_eq!(profile.content_type, "application/json");
        assert_eq!(profile.timeout_seconds, 30);
        assert!(profile.required_audience.is_empty());
        assert!(profile.is_valid());
    }

    #[test]
    fn async_poll_without_poll_config_is_invalid() {
        let mut profile = ExecutionProfile::sync_http("POST", "https://x/jobs");
        profile.mode = ExecutionMode::AsyncPoll;
        assert!(!profile.is_valid());
    }
}
