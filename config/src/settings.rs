//! Typed settings for the two services, read from the process environment after
//! [`crate::load_and_apply`] has merged `.env` and XDG config.
//!
//! `validate()` failures are configuration errors: binaries map them to exit code 2.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn var(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, SettingsError>
where
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| SettingsError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn parse_bool_or(key: &'static str, default: bool) -> Result<bool, SettingsError> {
    match var(key).as_deref() {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(SettingsError::Invalid {
            key,
            value: other.to_string(),
            reason: "expected true/false".into(),
        }),
    }
}

/// Settings for the Agent Host service (`AGENT_HOST_*` environment keys).
#[derive(Debug, Clone)]
pub struct AgentHostSettings {
    pub bind_addr: String,
    /// Default LLM provider type: "ollama" or "openai".
    pub llm_provider: String,
    pub llm_model: String,
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_timeout: Duration,
    /// Optional OAuth2 client-credentials gateway in front of the LLM API.
    pub gateway_token_url: Option<String>,
    pub gateway_client_id: Option<String>,
    pub gateway_client_secret: Option<String>,
    pub gateway_api_key: Option<String>,
    pub tools_provider_url: Option<String>,
    pub ping_interval: Duration,
    pub max_missed_pongs: u32,
    pub cleanup_interval: Duration,
    pub idle_timeout: Duration,
    pub max_iterations: u32,
    pub max_tool_calls_per_turn: u32,
    pub event_store_path: String,
}

impl AgentHostSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        let settings = Self {
            bind_addr: var("AGENT_HOST_BIND").unwrap_or_else(|| "127.0.0.1:8090".into()),
            llm_provider: var("AGENT_HOST_LLM_PROVIDER").unwrap_or_else(|| "ollama".into()),
            llm_model: var("AGENT_HOST_LLM_MODEL").unwrap_or_else(|| "llama3.2:3b".into()),
            llm_base_url: var("AGENT_HOST_LLM_BASE_URL"),
            llm_api_key: var("AGENT_HOST_LLM_API_KEY"),
            llm_timeout: Duration::from_secs_f64(parse_or("AGENT_HOST_LLM_TIMEOUT_SECONDS", 120.0)?),
            gateway_token_url: var("AGENT_HOST_GATEWAY_TOKEN_URL"),
            gateway_client_id: var("AGENT_HOST_GATEWAY_CLIENT_ID"),
            gateway_client_secret: var("AGENT_HOST_GATEWAY_CLIENT_SECRET"),
            gateway_api_key: var("AGENT_HOST_GATEWAY_API_KEY"),
            tools_provider_url: var("AGENT_HOST_TOOLS_PROVIDER_URL"),
            ping_interval: Duration::from_secs_f64(parse_or("AGENT_HOST_PING_INTERVAL_SECONDS", 30.0)?),
            max_missed_pongs: parse_or("AGENT_HOST_MAX_MISSED_PONGS", 3)?,
            cleanup_interval: Duration::from_secs_f64(parse_or(
                "AGENT_HOST_CLEANUP_INTERVAL_SECONDS",
                60.0,
            )?),
            idle_timeout: Duration::from_secs_f64(parse_or("AGENT_HOST_IDLE_TIMEOUT_SECONDS", 300.0)?),
            max_iterations: parse_or("AGENT_HOST_MAX_ITERATIONS", 10)?,
            max_tool_calls_per_turn: parse_or("AGENT_HOST_MAX_TOOL_CALLS_PER_TURN", 10)?,
            event_store_path: var("AGENT_HOST_EVENT_STORE_PATH")
                .unwrap_or_else(|| "agent-host.db".into()),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        match self.llm_provider.as_str() {
            "ollama" | "openai" => {}
            other => {
                return Err(SettingsError::Invalid {
                    key: "AGENT_HOST_LLM_PROVIDER",
                    value: other.to_string(),
                    reason: "expected ollama or openai".into(),
                })
            }
        }
        if self.llm_model.is_empty() {
            return Err(SettingsError::Missing("AGENT_HOST_LLM_MODEL"));
        }
        if self.max_missed_pongs == 0 {
            return Err(SettingsError::Invalid {
                key: "AGENT_HOST_MAX_MISSED_PONGS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.max_iterations == 0 {
            return Err(SettingsError::Invalid {
                key: "AGENT_HOST_MAX_ITERATIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        // Gateway credentials come as a set or not at all.
        let gateway = [
            self.gateway_token_url.is_some(),
            self.gateway_client_id.is_some(),
            self.gateway_client_secret.is_some(),
        ];
        if gateway.iter().any(|b| *b) && !gateway.iter().all(|b| *b) {
            return Err(SettingsError::Invalid {
                key: "AGENT_HOST_GATEWAY_TOKEN_URL",
                value: String::new(),
                reason: "gateway token URL, client id, and client secret must be set together"
                    .into(),
            });
        }
        Ok(())
    }
}

/// Settings for the Tools Provider service (`TOOLS_PROVIDER_*` environment keys).
#[derive(Debug, Clone)]
pub struct ToolsProviderSettings {
    pub bind_addr: String,
    /// RFC 8693 token exchange endpoint; when unset, the agent token is passed through.
    pub token_endpoint: Option<String>,
    pub token_client_id: Option<String>,
    pub token_client_secret: Option<String>,
    pub token_cache_cap: Duration,
    pub default_timeout: Duration,
    pub max_poll_attempts: u32,
    pub validate_schema: bool,
    pub access_cache_ttl: Duration,
    pub rate_limit_per_user: u32,
    pub event_store_path: String,
    pub sync_interval: Duration,
}

impl ToolsProviderSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        let settings = Self {
            bind_addr: var("TOOLS_PROVIDER_BIND").unwrap_or_else(|| "127.0.0.1:8091".into()),
            token_endpoint: var("TOOLS_PROVIDER_TOKEN_ENDPOINT"),
            token_client_id: var("TOOLS_PROVIDER_TOKEN_CLIENT_ID"),
            token_client_secret: var("TOOLS_PROVIDER_TOKEN_CLIENT_SECRET"),
            token_cache_cap: Duration::from_secs_f64(parse_or(
                "TOOLS_PROVIDER_TOKEN_CACHE_CAP_SECONDS",
                300.0,
            )?),
            default_timeout: Duration::from_secs_f64(parse_or(
                "TOOLS_PROVIDER_DEFAULT_TIMEOUT_SECONDS",
                30.0,
            )?),
            max_poll_attempts: parse_or("TOOLS_PROVIDER_MAX_POLL_ATTEMPTS", 60)?,
            validate_schema: parse_bool_or("TOOLS_PROVIDER_VALIDATE_SCHEMA", true)?,
            access_cache_ttl: Duration::from_secs_f64(parse_or(
                "TOOLS_PROVIDER_ACCESS_CACHE_TTL_SECONDS",
                60.0,
            )?),
            rate_limit_per_user: parse_or("TOOLS_PROVIDER_RATE_LIMIT_PER_USER", 60)?,
            event_store_path: var("TOOLS_PROVIDER_EVENT_STORE_PATH")
                .unwrap_or_else(|| "tools-provider.db".into()),
            sync_interval: Duration::from_secs_f64(parse_or(
                "TOOLS_PROVIDER_SYNC_INTERVAL_SECONDS",
                300.0,
            )?),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let exchange = [
            self.token_endpoint.is_some(),
            self.token_client_id.is_some(),
            self.token_client_secret.is_some(),
        ];
        if exchange.iter().any(|b| *b) && !exchange.iter().all(|b| *b) {
            return Err(SettingsError::Invalid {
                key: "TOOLS_PROVIDER_TOKEN_ENDPOINT",
                value: String::new(),
                reason: "token endpoint, client id, and client secret must be set together".into(),
            });
        }
        if self.max_poll_attempts == 0 {
            return Err(SettingsError::Invalid {
                key: "TOOLS_PROVIDER_MAX_POLL_ATTEMPTS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_host_defaults_validate() {
        let s = AgentHostSettings {
            bind_addr: "127.0.0.1:8090".into(),
            llm_provider: "ollama".into(),
            llm_model: "llama3.2:3b".into(),
            llm_base_url: None,
            llm_api_key: None,
            llm_timeout: Duration::from_secs(120),
            gateway_token_url: None,
            gateway_client_id: None,
            gateway_client_secret: None,
            gateway_api_key: None,
            tools_provider_url: None,
            ping_interval: Duration::from_secs(30),
            max_missed_pongs: 3,
            cleanup_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            max_iterations: 10,
            max_tool_calls_per_turn: 10,
            event_store_path: "agent-host.db".into(),
        };
        assert!(s.validate().is_ok());
    }

    #[test]
    fn unknown_provider_rejected() {
        let mut s = AgentHostSettings {
            bind_addr: String::new(),
            llm_provider: "claude".into(),
            llm_model: "m".into(),
            llm_base_url: None,
            llm_api_key: None,
            llm_timeout: Duration::from_secs(1),
            gateway_token_url: None,
            gateway_client_id: None,
            gateway_client_secret: None,
            gateway_api_key: None,
            tools_provider_url: None,
            ping_interval: Duration::from_secs(1),
            max_missed_pongs: 1,
            cleanup_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(1),
            max_iterations: 1,
            max_tool_calls_per_turn: 1,
            event_store_path: String::new(),
        };
        assert!(s.validate().is_err());
        s.llm_provider = "openai".into();
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_gateway_credentials_rejected() {
        let mut s = AgentHostSettings {
            bind_addr: String::new(),
            llm_provider: "openai".into(),
            llm_model: "m".into(),
            llm_base_url: None,
            llm_api_key: None,
            llm_timeout: Duration::from_secs(1),
            gateway_token_url: Some("https://idp/token".into()),
            gateway_client_id: None,
            gateway_client_secret: None,
            gateway_api_key: None,
            tools_provider_url: None,
            ping_interval: Duration::from_secs(1),
            max_missed_pongs: 1,
            cleanup_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(1),
            max_iterations: 1,
            max_tool_calls_per_turn: 1,
            event_store_path: String::new(),
        };
        assert!(s.validate().is_err());
        s.gateway_client_id = Some("id".into());
        s.gateway_client_secret = Some("secret".into());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_exchange_credentials_rejected() {
        let s = ToolsProviderSettings {
            bind_addr: String::new(),
            token_endpoint: Some("https://idp/token".into()),
            token_client_id: None,
            token_client_secret: None,
            token_cache_cap: Duration::from_secs(300),
            default_timeout: Duration::from_secs(30),
            max_poll_attempts: 60,
            validate_schema: true,
            access_cache_ttl: Duration::from_secs(60),
            rate_limit_per_user: 60,
            event_store_path: String::new(),
            sync_interval: Duration::from_secs(300),
        };
        assert!(s.validate().is_err());
    }
}
