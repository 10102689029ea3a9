//! OpenAPI 3.x ingestion: paths × methods become tools, parameters and JSON
//! request bodies merge into one argument schema, and URL/body templates are
//! rewritten for the executor's renderer.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{AdapterError, IngestionResult, SourceAdapter};
use crate::domain::tool_definition::inventory_hash;
use crate::domain::{AuthConfig, ExecutionMode, ExecutionProfile, ToolDefinition};

const SUPPORTED_METHODS: [&str; 5] = ["get", "post", "put", "patch", "delete"];
const BODY_METHODS: [&str; 3] = ["post", "put", "patch"];

pub struct OpenApiAdapter {
    http: reqwest::Client,
    default_timeout_seconds: u64,
}

impl OpenApiAdapter {
    pub fn new(default_timeout_seconds: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            default_timeout_seconds,
        }
    }

    async fn fetch(&self, url: &str, auth: &AuthConfig) -> Result<String, AdapterError> {
        let mut request = self.http.get(url);
        match auth {
            AuthConfig::ApiKey {
                name,
                value,
                location,
            } if location == "query" => {
                request = request.query(&[(name.as_str(), value.as_str())]);
            }
            AuthConfig::ApiKey { name, value, .. } => {
                request = request.header(name.as_str(), value.as_str());
            }
            _ => {
                if let Some(token) = auth.bearer_token() {
                    request = request.bearer_auth(token);
                }
            }
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
                "descriptor endpoint returned {}",
                status
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl SourceAdapter for OpenApiAdapter {
    async fn fetch_and_normalize(
        &self,
        _source_id: &str,
        url: &str,
        auth: &AuthConfig,
        default_audience: &str,
    ) -> Result<IngestionResult, AdapterError> {
        let raw = self.fetch(url, auth).await?;
        let document = sniff_parse(&raw)?;
        normalize_document(&document, url, default_audience, self.default_timeout_seconds)
    }
}

/// JSON first, YAML fallback.
fn sniff_parse(raw: &str) -> Result<Value, AdapterError> {
    if raw.trim_start().starts_with(['{', '[']) {
        serde_json::from_str(raw).map_err(|e| AdapterError::Parse(e.to_string()))
    } else {
        serde_yaml::from_str(raw).map_err(|e| AdapterError::Parse(e.to_string()))
    }
}

pub fn normalize_document(
    document: &Value,
    descriptor_url: &str,
    default_audience: &str,
    default_timeout_seconds: u64,
) -> Result<IngestionResult, AdapterError> {
    if document.get("swagger").is_some() {
        return Err(AdapterError::Unsupported(
            "Swagger 2.x descriptors are not supported; provide OpenAPI 3.x".into(),
        ));
    }
    if document.get("openapi").is_none() {
        return Err(AdapterError::Parse("missing openapi version field".into()));
    }

    let mut result = IngestionResult {
        source_version: document
            .pointer("/info/version")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        ..Default::default()
    };

    let base_url = resolve_base_url(document, descriptor_url);
    let audience = document_audience(document).unwrap_or_else(|| default_audience.to_string());

    let Some(paths) = document.get("paths").and_then(|v| v.as_object()) else {
        result.inventory_hash = inventory_hash(&[]);
        result.warnings.push("descriptor has no paths".into());
        return Ok(result);
    };

    for (path, item) in paths {
        let Some(item) = item.as_object() else {
            continue;
        };
        for method in SUPPORTED_METHODS {
            let Some(operation) = item.get(method) else {
                continue;
            };
            match normalize_operation(
                document,
                &base_url,
                path,
                method,
                operation,
                &audience,
                default_timeout_seconds,
            ) {
                Ok(tool) => result.tools.push(tool),
                Err(e) => result
                    .warnings
                    .push(format!("{} {}: {}", method.to_uppercase(), path, e)),
            }
        }
    }

    result.inventory_hash = inventory_hash(&result.tools);
    Ok(result)
}

fn resolve_base_url(document: &Value, descriptor_url: &str) -> String {
    let server = document
        .pointer("/servers/0/url")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let origin = descriptor_origin(descriptor_url);
    if server.is_empty() {
        origin
    } else if server.starts_with("http://") || server.starts_with("https://") {
        server.trim_end_matches('/').to_string()
    } else {
        // Relative server URL resolves against the descriptor's host.
        format!("{}/{}", origin, server.trim_matches('/'))
    }
}

fn descriptor_origin(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.trim_end_matches('/').to_string();
    };
    let after = &url[scheme_end + 3..];
    match after.find('/') {
        Some(i) => url[..scheme_end + 3 + i].to_string(),
        None => url.to_string(),
    }
}

/// The first OAuth2 security scheme carrying `x-audience` decides the exchange
/// audience; without one, the agent token passes through.
fn document_audience(document: &Value) -> Option<String> {
    let schemes = document
        .pointer("/components/securitySchemes")?
        .as_object()?;
    schemes.values().find_map(|scheme| {
        (scheme.get("type").and_then(|t| t.as_str()) == Some("oauth2"))
            .then(|| scheme.get("x-audience").and_then(|a| a.as_str()))
            .flatten()
            .map(str::to_string)
    })
}

#[allow(clippy::too_many_arguments)]
fn normalize_operation(
    document: &Value,
    base_url: &str,
    path: &str,
    method: &str,
    operation: &Value,
    audience: &str,
    default_timeout_seconds: u64,
) -> Result<ToolDefinition, AdapterError> {
    let operation_id = operation
        .get("operationId")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| generated_operation_id(method, path));

    let description = operation
        .get("description")
        .or_else(|| operation.get("summary"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} {}", method.to_uppercase(), path));

    let mut properties = Map::new();
    let mut required: Vec<String> = Vec::new();

    for parameter in operation
        .get("parameters")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        let parameter = resolve_ref(document, parameter)?;
        let Some(name) = parameter.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let location = parameter.get("in").and_then(|v| v.as_str()).unwrap_or("");
        if location != "path" && location != "query" {
            continue;
        }
        let mut schema = parameter
            .get("schema")
            .map(|s| resolve_ref(document, s))
            .transpose()?
            .unwrap_or_else(|| json!({"type": "string"}));
        if let Some(desc) = parameter.get("description").and_then(|v| v.as_str()) {
            if let Some(obj) = schema.as_object_mut() {
                obj.entry("description")
                    .or_insert_with(|| Value::String(desc.to_string()));
            }
        }
        if parameter.get("required").and_then(|v| v.as_bool()).unwrap_or(false) {
            required.push(name.to_string());
        }
        properties.insert(name.to_string(), schema);
    }

    let mut body_properties: Vec<String> = Vec::new();
    let mut content_type = "application/json".to_string();
    if BODY_METHODS.contains(&method) {
        if let Some(body_spec) = operation.get("requestBody") {
            let body_spec = resolve_ref(document, body_spec)?;
            if let Some(content) = body_spec.get("content").and_then(|v| v.as_object()) {
                let (chosen_type, media) = content
                    .get_key_value("application/json")
                    .map(|(k, v)| (k.clone(), v))
                    .or_else(|| content.iter().next().map(|(k, v)| (k.clone(), v)))
                    .map(|(k, v)| (k, v.clone()))
                    .unwrap_or((content_type.clone(), Value::Null));
                content_type = chosen_type;
                if content_type == "application/json" {
                    if let Some(schema) = media.get("schema") {
                        let schema = resolve_ref(document, schema)?;
                        if let Some(props) = schema.get("properties").and_then(|v| v.as_object()) {
                            for (name, prop) in props {
                                let prop = resolve_ref(document, prop)?;
                                body_properties.push(name.clone());
                                properties.insert(name.clone(), prop);
                            }
                        }
                        for item in schema
                            .get("required")
                            .and_then(|v| v.as_array())
                            .into_iter()
                            .flatten()
                        {
                            if let Some(name) = item.as_str() {
                                if !required.iter().any(|r| r == name) {
                                    required.push(name.to_string());
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    let input_schema = json!({
        "type": "object",
        "properties": properties,
        "required": required,
    });

    let url_template = format!("{}{}", base_url, rewrite_path_params(path));
    let body_template = (!body_properties.is_empty()).then(|| {
        let fields: Vec<String> = body_properties
            .iter()
            .map(|name| format!(r#""{}": {{{{ {} | tojson }}}}"#, name, name))
            .collect();
        format!("{{{}}}", fields.join(", "))
    });

    let tags = operation
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(ToolDefinition {
        name: operation_id.clone(),
        description,
        input_schema,
        source_path: path.to_string(),
        execution_profile: ExecutionProfile {
            mode: ExecutionMode::SyncHttp,
            method: method.to_uppercase(),
            url_template,
            headers_template: Default::default(),
            body_template,
            content_type,
            response_mapping: None,
            required_audience: audience.to_string(),
            required_scopes: Vec::new(),
            timeout_seconds: default_timeout_seconds,
            poll_config: None,
        },
        tags,
        version: None,
    })
}

/// `get` + `/users/{id}/posts` -> `get_users_id_posts`.
fn generated_operation_id(method: &str, path: &str) -> String {
    let cleaned: String = path
        .chars()
        .map(|c| match c {
            '{' | '}' => '\0',
            '/' | '-' | '.' => '_',
            other => other.to_ascii_lowercase(),
        })
        .filter(|c| *c != '\0')
        .collect();
    let cleaned = cleaned.trim_matches('_');
    let mut id = format!("{}_{}", method, cleaned);
    while id.contains("__") {
        id = id.replace("__", "_");
    }
    id.trim_end_matches('_').to_string()
}

/// `{param}` path segments become `{{ param }}` for the renderer.
fn rewrite_path_params(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut rest = path;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &rest[open + 1..open + close];
        out.push_str(&format!("{{{{ {} }}}}", name));
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    out
}

/// Resolves an internal `$ref` (`#/components/...`); external refs fail.
fn resolve_ref(document: &Value, value: &Value) -> Result<Value, AdapterError> {
    let Some(reference) = value.get("$ref").and_then(|v| v.as_str()) else {
        return Ok(value.clone());
    };
    let Some(pointer) = reference.strip_prefix('#') else {
        return Err(AdapterError::Parse(format!(
            "external $ref not supported: {}",
            reference
        )));
    };
    let resolved = document
        .pointer(pointer)
        .ok_or_else(|| AdapterError::Parse(format!("unresolvable $ref: {}", reference)))?;
    // One level of nesting is enough for parameter/schema refs in practice.
    resolve_ref(document, resolved)
}
