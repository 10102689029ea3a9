//! Tool executor: validates arguments, renders request templates, exchanges
//! tokens, and proxies the call under a circuit breaker in sync, async-poll,
//! or MCP mode.
//!
//! Logging discipline: bodies truncate at 500 bytes, Authorization renders as
//! `Bearer ***`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_core::ErrorKind;
use serde_json::Value;

use crate::breaker::BreakerRegistry;
use crate::domain::{ExecutionMode, ExecutionProfile, PollConfig, ToolDefinition};
use crate::exchange::{TokenExchangeError, TokenExchanger};
use crate::mcp::McpRegistry;
use crate::render::{RenderError, TemplateRenderer};

const MAX_LOG_BODY_LENGTH: usize = 500;

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub default_timeout: Duration,
    pub max_poll_attempts: u32,
    pub enable_schema_validation: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_poll_attempts: 60,
            enable_schema_validation: true,
        }
    }
}

/// Successful execution outcome.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ToolExecutionOutput {
    pub tool_id: String,
    /// "completed" or "failed" (failed covers upstream-reported failure).
    pub status: String,
    pub result: Option<Value>,
    pub execution_time_ms: u64,
    pub upstream_status: Option<u16>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// Execution failure with its categorized kind and retry hint.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct ToolExecutionError {
    pub message: String,
    pub error_code: ErrorKind,
    pub tool_id: Option<String>,
    pub upstream_status: Option<u16>,
    pub is_retryable: bool,
    pub details: Value,
}

impl ToolExecutionError {
    fn new(message: impl Into<String>, error_code: ErrorKind, tool_id: &str) -> Self {
        Self {
            message: message.into(),
            error_code,
            tool_id: Some(tool_id.to_string()),
            upstream_status: None,
            is_retryable: error_code.is_retryable(),
            details: Value::Null,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

pub struct ToolExecutor {
    exchanger: Arc<TokenExchanger>,
    breakers: Arc<BreakerRegistry>,
    mcp: Arc<McpRegistry>,
    renderer: TemplateRenderer,
    http: reqwest::Client,
    config: ExecutorConfig,
}

impl ToolExecutor {
    pub fn new(
        exchanger: Arc<TokenExchanger>,
        breakers: Arc<BreakerRegistry>,
        mcp: Arc<McpRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            exchanger,
            breakers,
            mcp,
            renderer: TemplateRenderer::new(),
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Executes one tool call end to end.
    pub async fn execute(
        &self,
        tool_id: &str,
        definition: &ToolDefinition,
        arguments: &Value,
        agent_token: &str,
        source_id: Option<&str>,
        validate_schema: Option<bool>,
    ) -> Result<ToolExecutionOutput, ToolExecutionError> {
        let started = Instant::now();
        tracing::debug!(
            tool.id = tool_id,
            tool.name = %definition.name,
            tool.mode = ?definition.execution_profile.mode,
            "executing tool"
        );

        let should_validate = validate_schema.unwrap_or(self.config.enable_schema_validation);
        if should_validate {
            self.validate_arguments(tool_id, &definition.input_schema, arguments)?;
        }

        let profile = &definition.execution_profile;
        let upstream_token = self.exchange_token(tool_id, agent_token, profile).await?;

        let mut output = match profile.mode {
            ExecutionMode::SyncHttp => {
                self.execute_sync(tool_id, profile, arguments, &upstream_token, source_id)
                    .await?
            }
            ExecutionMode::AsyncPoll => {
                self.execute_async_poll(tool_id, profile, arguments, &upstream_token, source_id)
                    .await?
            }
            ExecutionMode::Mcp => self.execute_mcp(tool_id, profile, arguments, source_id).await?,
        };

        output.execution_time_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            tool.id = tool_id,
            tool.name = %definition.name,
            status = %output.status,
            upstream_status = ?output.upstream_status,
            duration_ms = output.execution_time_ms,
            "tool execution finished"
        );
        Ok(output)
    }

    /// Draft-7 validation; aggregates up to the first five errors.
    fn validate_arguments(
        &self,
        tool_id: &str,
        schema: &Value,
        arguments: &Value,
    ) -> Result<(), ToolExecutionError> {
        if schema.is_null() {
            return Ok(());
        }
        let validator = jsonschema::draft7::new(schema).map_err(|e| {
            ToolExecutionError::new(
                format!("invalid argument schema: {}", e),
                ErrorKind::ValidationError,
                tool_id,
            )
        })?;
        let errors: Vec<String> = validator
            .iter_errors(arguments)
            .take(5)
            .map(|e| {
                let path = e.instance_path.to_string();
                let path = path.trim_start_matches('/').replace('/', ".");
                let path = if path.is_empty() { "root".to_string() } else { path };
                format!("{}: {}", path, e)
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ToolExecutionError::new(
                format!("argument validation failed: {}", errors.join("; ")),
                ErrorKind::ValidationError,
                tool_id,
            )
            .with_details(serde_json::json!({ "validation_errors": errors })))
        }
    }

    /// Token exchange when the profile names an audience; pass-through otherwise.
    async fn exchange_token(
        &self,
        tool_id: &str,
        agent_token: &str,
        profile: &ExecutionProfile,
    ) -> Result<String, ToolExecutionError> {
        if profile.required_audience.is_empty() {
            tracing::debug!("no audience required, using agent token directly");
            return Ok(agent_token.to_string());
        }
        self.exchanger
            .exchange(agent_token, &profile.required_audience, &profile.required_scopes)
            .await
            .map_err(|e: TokenExchangeError| {
                let retryable = e.is_retryable();
                let mut err = ToolExecutionError::new(
                    format!("token exchange failed: {}", e),
                    ErrorKind::TokenExchangeFailed,
                    tool_id,
                );
                err.is_retryable = retryable;
                err
            })
    }

    fn render_request(
        &self,
        tool_id: &str,
        profile: &ExecutionProfile,
        arguments: &Value,
        upstream_token: &str,
    ) -> Result<(String, BTreeMap<String, String>, Option<String>), ToolExecutionError> {
        let to_exec_err = |e: RenderError, tool_id: &str| {
            let details = match &e {
                RenderError::Undefined { available, .. } => {
                    serde_json::json!({ "available_args": available })
                }
                _ => Value::Null,
            };
            ToolExecutionError::new(e.to_string(), ErrorKind::TemplateError, tool_id)
                .with_details(details)
        };

        let url = self
            .renderer
            .render(&profile.url_template, arguments, "url")
            .map_err(|e| to_exec_err(e, tool_id))?;

        let mut headers = BTreeMap::new();
        // The exchanged token always wins; templates cannot override it.
        headers.insert(
            "Authorization".to_string(),
            format!("Bearer {}", upstream_token),
        );
        for (name, template) in &profile.headers_template {
            if name.eq_ignore_ascii_case("authorization") {
                continue;
            }
            let value = self
                .renderer
                .render(template, arguments, &format!("header:{}", name))
                .map_err(|e| to_exec_err(e, tool_id))?;
            headers.insert(name.clone(), value);
        }

        let body = match &profile.body_template {
            Some(template) => Some(
                self.renderer
                    .render(template, arguments, "body")
                    .map_err(|e| to_exec_err(e, tool_id))?,
            ),
            None => None,
        };
        Ok((url, headers, body))
    }

    async fn execute_sync(
        &self,
        tool_id: &str,
        profile: &ExecutionProfile,
        arguments: &Value,
        upstream_token: &str,
        source_id: Option<&str>,
    ) -> Result<ToolExecutionOutput, ToolExecutionError> {
        let (url, headers, body) = self.render_request(tool_id, profile, arguments, upstream_token)?;
        let breaker_key = source_id.map(str::to_string).unwrap_or_else(|| url.clone());
        let breaker = self.breakers.get(&breaker_key);

        self.log_request(&profile.method, &url, &headers, body.as_deref());

        breaker.acquire().await.map_err(|_| {
            ToolExecutionError::new(
                format!("upstream {} is unavailable (circuit open)", breaker_key),
                ErrorKind::CircuitOpen,
                tool_id,
            )
        })?;

        let timeout = if profile.timeout_seconds > 0 {
            Duration::from_secs(profile.timeout_seconds)
        } else {
            self.config.default_timeout
        };
        let response = self
            .do_http_request(&profile.method, &url, &headers, body, &profile.content_type, timeout)
            .await;

        match response {
            Ok((status, text)) => {
                // 5xx counts against the breaker; 4xx does not.
                if status >= 500 {
                    breaker.record_failure().await;
                } else {
                    breaker.record_success().await;
                }
                self.log_response(status, &text);
                self.translate_response(tool_id, profile, status, text)
            }
            Err(e) => {
                breaker.record_failure().await;
                Err(e)
            }
        }
    }

    /// Trigger, then poll the status URL with exponential backoff until a
    /// terminal status or attempt exhaustion.
    async fn execute_async_poll(
        &self,
        tool_id: &str,
        profile: &ExecutionProfile,
        arguments: &Value,
        upstream_token: &str,
        source_id: Option<&str>,
    ) -> Result<ToolExecutionOutput, ToolExecutionError> {
        let poll_config = profile.poll_config.as_ref().ok_or_else(|| {
            ToolExecutionError::new(
                "async poll execution requires poll_config",
                ErrorKind::ValidationError,
                tool_id,
            )
        })?;

        let trigger = self
            .execute_sync(tool_id, profile, arguments, upstream_token, source_id)
            .await?;
        if trigger.status == "failed" {
            return Ok(trigger);
        }

        // Merge the trigger response into template variables so the status URL
        // can reference fields like the job id.
        let mut poll_args = arguments.clone();
        if let (Some(args), Some(Value::Object(body))) =
            (poll_args.as_object_mut(), trigger.result.as_ref())
        {
            for (key, value) in body {
                args.insert(key.clone(), value.clone());
            }
        }

        self.poll_for_completion(tool_id, poll_config, &poll_args, upstream_token, source_id)
            .await
    }

    async fn poll_for_completion(
        &self,
        tool_id: &str,
        poll_config: &PollConfig,
        poll_args: &Value,
        upstream_token: &str,
        source_id: Option<&str>,
    ) -> Result<ToolExecutionOutput, ToolExecutionError> {
        let max_attempts = poll_config.max_poll_attempts.min(self.config.max_poll_attempts);
        let mut interval = poll_config.poll_interval_seconds;
        let breaker = self
            .breakers
            .get(source_id.unwrap_or("poll"));
        let headers = BTreeMap::from([(
            "Authorization".to_string(),
            format!("Bearer {}", upstream_token),
        )]);

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs_f64(interval)).await;
                interval = (interval * poll_config.backoff_multiplier)
                    .min(poll_config.max_interval_seconds);
            }

            let status_url = self
                .renderer
                .render(&poll_config.status_url_template, poll_args, "status_url")
                .map_err(|e| {
                    ToolExecutionError::new(e.to_string(), ErrorKind::TemplateError, tool_id)
                })?;

            if breaker.acquire().await.is_err() {
                continue;
            }
            let response = self
                .do_http_request(
                    "GET",
                    &status_url,
                    &headers,
                    None,
                    "application/json",
                    self.config.default_timeout,
                )
                .await;
            let (status, text) = match response {
                Ok(pair) => {
                    breaker.record_success().await;
                    pair
                }
                Err(e) => {
                    breaker.record_failure().await;
                    tracing::warn!(attempt, "poll attempt failed: {}", e);
                    continue;
                }
            };
            if status != 200 {
                tracing::warn!(attempt, status, "poll status request rejected");
                continue;
            }
            let data: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let status_value = extract_json_path(&data, &poll_config.status_field_path)
                .map(stringify_status)
                .unwrap_or_default();

            if poll_config.completed_values.contains(&status_value) {
                let result = extract_json_path(&data, &poll_config.result_field_path).cloned();
                return Ok(ToolExecutionOutput {
                    tool_id: tool_id.to_string(),
                    status: "completed".into(),
                    result,
                    execution_time_ms: 0,
                    upstream_status: Some(200),
                    metadata: BTreeMap::from([(
                        "poll_attempts".into(),
                        Value::from(attempt + 1),
                    )]),
                });
            }
            if poll_config.failed_values.contains(&status_value) {
                return Ok(ToolExecutionOutput {
                    tool_id: tool_id.to_string(),
                    status: "failed".into(),
                    result: Some(data),
                    execution_time_ms: 0,
                    upstream_status: Some(200),
                    metadata: BTreeMap::from([(
                        "poll_attempts".into(),
                        Value::from(attempt + 1),
                    )]),
                });
            }
            tracing::debug!(attempt, status = %status_value, "still pending");
        }

        Err(ToolExecutionError::new(
            format!("async operation did not complete within {} attempts", max_attempts),
            ErrorKind::PollTimeout,
            tool_id,
        )
        .with_details(serde_json::json!({ "max_attempts": max_attempts })))
    }

    /// MCP-mode calls route to the live session for the owning source; the
    /// profile's `url_template` carries the MCP tool name.
    async fn execute_mcp(
        &self,
        tool_id: &str,
        profile: &ExecutionProfile,
        arguments: &Value,
        source_id: Option<&str>,
    ) -> Result<ToolExecutionOutput, ToolExecutionError> {
        let source_id = source_id.unwrap_or_else(|| tool_id.split(':').next().unwrap_or(tool_id));
        let result = self
            .mcp
            .call(source_id, &profile.url_template, arguments.clone())
            .await
            .map_err(|e| {
                ToolExecutionError::new(e.to_string(), ErrorKind::Unavailable, tool_id)
            })?;
        let failed = result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(ToolExecutionOutput {
            tool_id: tool_id.to_string(),
            status: if failed { "failed" } else { "completed" }.into(),
            result: Some(result),
            execution_time_ms: 0,
            upstream_status: None,
            metadata: BTreeMap::new(),
        })
    }

    async fn do_http_request(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<String>,
        content_type: &str,
        timeout: Duration,
    ) -> Result<(u16, String), ToolExecutionError> {
        let method: reqwest::Method = method.parse().map_err(|_| ToolExecutionError {
            message: format!("unsupported HTTP method: {}", method),
            error_code: ErrorKind::ValidationError,
            tool_id: None,
            upstream_status: None,
            is_retryable: false,
            details: Value::Null,
        })?;
        let mut request = self
            .http
            .request(method, url)
            .timeout(timeout)
            .header("Content-Type", content_type);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolExecutionError {
                    message: format!("upstream request timed out after {:?}", timeout),
                    error_code: ErrorKind::UpstreamTimeout,
                    tool_id: None,
                    upstream_status: None,
                    is_retryable: true,
                    details: Value::Null,
                }
            } else {
                ToolExecutionError {
                    message: format!("upstream request failed: {}", e),
                    error_code: ErrorKind::ConnectionError,
                    tool_id: None,
                    upstream_status: None,
                    is_retryable: true,
                    details: Value::Null,
                }
            }
        })?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| ToolExecutionError {
            message: format!("failed reading upstream response: {}", e),
            error_code: ErrorKind::ConnectionError,
            tool_id: None,
            upstream_status: Some(status),
            is_retryable: true,
            details: Value::Null,
        })?;
        Ok((status, text))
    }

    /// Maps upstream status codes to the error table; 2xx parses the body.
    fn translate_response(
        &self,
        tool_id: &str,
        profile: &ExecutionProfile,
        status: u16,
        text: String,
    ) -> Result<ToolExecutionOutput, ToolExecutionError> {
        if (200..300).contains(&status) {
            let parsed = parse_body(&text, profile.response_mapping.as_ref());
            return Ok(ToolExecutionOutput {
                tool_id: tool_id.to_string(),
                status: "completed".into(),
                result: Some(parsed),
                execution_time_ms: 0,
                upstream_status: Some(status),
                metadata: BTreeMap::new(),
            });
        }

        let kind = match status {
            401 => ErrorKind::TokenExchangeFailed,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            429 => ErrorKind::RateLimited,
            s if s >= 500 => ErrorKind::ServerError,
            _ => ErrorKind::ValidationError,
        };
        let mut err = ToolExecutionError::new(
            format!("upstream returned {}", status),
            kind,
            tool_id,
        );
        // A 401 from the upstream (not the exchanger) will not heal on retry.
        if status == 401 {
            err.is_retryable = false;
        }
        err.upstream_status = Some(status);
        err.details = serde_json::json!({
            "upstream_body": text.chars().take(MAX_LOG_BODY_LENGTH).collect::<String>(),
        });
        Err(err)
    }

    fn log_request(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
    ) {
        let safe_headers: BTreeMap<&str, &str> = headers
            .iter()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case("authorization") {
                    (k.as_str(), "Bearer ***")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        tracing::debug!(
            method,
            url,
            headers = ?safe_headers,
            body = truncate_body(body.unwrap_or("")),
            "upstream request"
        );
    }

    fn log_response(&self, status: u16, body: &str) {
        tracing::debug!(status, body = truncate_body(body), "upstream response");
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_LOG_BODY_LENGTH {
        format!(
            "{}... ({} bytes total)",
            &body[..body
                .char_indices()
                .take_while(|(i, _)| *i < MAX_LOG_BODY_LENGTH)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0)],
            body.len()
        )
    } else {
        body.to_string()
    }
}

/// 2xx bodies parse as JSON with a text fallback; optional response mapping
/// extracts output keys by dot path.
fn parse_body(text: &str, mapping: Option<&BTreeMap<String, String>>) -> Value {
    let data: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Value::String(text.to_string()),
    };
    match mapping {
        Some(mapping) if !mapping.is_empty() => {
            let mut mapped = serde_json::Map::new();
            for (output_field, path) in mapping {
                mapped.insert(
                    output_field.clone(),
                    extract_json_path(&data, path).cloned().unwrap_or(Value::Null),
                );
            }
            Value::Object(mapped)
        }
        _ => data,
    }
}

/// Dot-notation extraction; numeric segments index into arrays.
pub(crate) fn extract_json_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn stringify_status(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use serde_json::json;

    fn executor() -> ToolExecutor {
        ToolExecutor::new(
            Arc::new(TokenExchanger::new(None)),
            Arc::new(BreakerRegistry::new(BreakerConfig::default(), None)),
            Arc::new(McpRegistry::new()),
            ExecutorConfig::default(),
        )
    }

    fn definition(schema: Value) -> ToolDefinition {
        ToolDefinition {
            name: "transfer".into(),
            description: "Transfer money".into(),
            input_schema: schema,
            source_path: "/transfer".into(),
            execution_profile: ExecutionProfile::sync_http("POST", "https://api/transfer"),
            tags: Vec::new(),
            version: None,
        }
    }

    #[tokio::test]
    async fn validation_failure_aggregates_errors_and_skips_everything_else() {
        let exec = executor();
        let def = definition(json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "string"},
                "amount": {"type": "number"},
            },
            "required": ["user_id", "amount"],
        }));
        let err = exec
            .execute(
                "src1:transfer",
                &def,
                &json!({"user_id": 42, "amount": "ten"}),
                "agent-token",
                Some("src1"),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorKind::ValidationError);
        assert!(!err.is_retryable);
        let errors = err.details["validation_errors"].as_array().unwrap();
        assert_eq!(errors.len(), 2);
        let joined = errors
            .iter()
            .map(|e| e.as_str().unwrap())
            .collect::<Vec<_>>()
            .join("; ");
        assert!(joined.contains("user_id"), "{}", joined);
        assert!(joined.contains("amount"), "{}", joined);
    }

    #[tokio::test]
    async fn validation_can_be_disabled_per_call() {
        let exec = executor();
        let mut def = definition(json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}},
            "required": ["a"],
        }));
        // No valid upstream; the point is validation is skipped and the error
        // comes from the template/connection stage instead.
        def.execution_profile.url_template = "{{ missing_var }}".into();
        let err = exec
            .execute("src1:t", &def, &json!({}), "tok", Some("src1"), Some(false))
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorKind::TemplateError);
    }

    #[tokio::test]
    async fn template_error_lists_available_keys() {
        let exec = executor();
        let mut def = definition(Value::Null);
        def.execution_profile.url_template = "https://api/{{ item_id }}".into();
        let err = exec
            .execute(
                "src1:t",
                &def,
                &json!({"other": 1}),
                "tok",
                Some("src1"),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorKind::TemplateError);
        assert_eq!(err.details["available_args"], json!(["other"]));
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_upstream_call() {
        let exec = executor();
        let breaker = exec.breakers.get("src-down");
        for _ in 0..5 {
            breaker.acquire().await.unwrap();
            breaker.record_failure().await;
        }
        let def = definition(Value::Null);
        let err = exec
            .execute("src-down:t", &def, &json!({}), "tok", Some("src-down"), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorKind::CircuitOpen);
        assert!(err.is_retryable);
    }

    #[test]
    fn response_translation_maps_status_codes() {
        let exec = executor();
        let profile = ExecutionProfile::sync_http("GET", "https://api/x");
        for (status, kind, retryable) in [
            (401, ErrorKind::TokenExchangeFailed, false),
            (403, ErrorKind::Forbidden, false),
            (404, ErrorKind::NotFound, false),
            (429, ErrorKind::RateLimited, true),
            (500, ErrorKind::ServerError, true),
        ] {
            let err = exec
                .translate_response("t", &profile, status, String::new())
                .unwrap_err();
            assert_eq!(err.error_code, kind, "status {}", status);
            assert_eq!(err.is_retryable, retryable, "status {}", status);
            assert_eq!(err.upstream_status, Some(status));
        }
    }

    #[test]
    fn success_body_parses_json_with_text_fallback_and_mapping() {
        assert_eq!(
            parse_body(r#"{"sum": 5}"#, None),
            json!({"sum": 5})
        );
        assert_eq!(parse_body("plain text", None), json!("plain text"));

        let mapping = BTreeMap::from([("total".to_string(), "data.sum".to_string())]);
        assert_eq!(
            parse_body(r#"{"data": {"sum": 7}}"#, Some(&mapping)),
            json!({"total": 7})
        );
    }

    #[test]
    fn json_path_extraction_handles_arrays_and_misses() {
        let data = json!({"jobs": [{"id": "j1"}, {"id": "j2"}]});
        assert_eq!(
            extract_json_path(&data, "jobs.1.id"),
            Some(&json!("j2"))
        );
        assert!(extract_json_path(&data, "jobs.5.id").is_none());
        assert!(extract_json_path(&data, "missing.path").is_none());
    }

    #[test]
    fn log_body_truncates_at_limit() {
        let long = "x".repeat(600);
        let logged = truncate_body(&long);
        assert!(logged.contains("600 bytes total"));
        assert!(logged.len() < 600);
        assert_eq!(truncate_body("short"), "short");
    }
}
