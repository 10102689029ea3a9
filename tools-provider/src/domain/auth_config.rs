//! Authentication configuration for fetching upstream descriptors.

use serde::{Deserialize, Serialize};

/// How the provider authenticates to a source when fetching its descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        token: String,
    },
    /// Token read from the environment at fetch time, never persisted.
    BearerEnv {
        env_var: String,
    },
    Oauth2 {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scopes: Vec<String>,
    },
    ApiKey {
        name: String,
        value: String,
        /// "header" or "query".
        #[serde(default = "AuthConfig::default_location")]
        location: String,
    },
}

impl AuthConfig {
    fn default_location() -> String {
        "header".to_string()
    }

    /// Resolves a bearer token when this config can produce one directly.
    pub fn bearer_token(&self) -> Option<String> {
        match self {
            Self::Bearer { token } => Some(token.clone()),
            Self::BearerEnv { env_var } => std::env::var(env_var).ok(),
            _ => None,
        }
    }
}
