//! Categorized error kinds shared by both services.
//!
//! Errors are categorized, not named: every failure anywhere in the system maps
//! to one of these kinds, which fixes its retryability and HTTP surface.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    TemplateError,
    AuthError,
    TokenExchangeFailed,
    Forbidden,
    NotFound,
    ModelNotFound,
    RateLimited,
    CircuitOpen,
    UpstreamTimeout,
    PollTimeout,
    Unavailable,
    ConnectionError,
    ServerError,
    IterationCap,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::CircuitOpen
                | Self::UpstreamTimeout
                | Self::PollTimeout
                | Self::Unavailable
                | Self::ConnectionError
                | Self::ServerError
        )
    }

    /// HTTP status this kind surfaces as.
    pub fn http_status(self) -> u16 {
        match self {
            Self::ValidationError | Self::TemplateError => 400,
            Self::AuthError | Self::TokenExchangeFailed => 401,
            Self::Forbidden => 403,
            Self::NotFound | Self::ModelNotFound => 404,
            Self::RateLimited => 429,
            Self::CircuitOpen | Self::Unavailable | Self::ConnectionError => 503,
            Self::UpstreamTimeout | Self::PollTimeout => 504,
            Self::ServerError | Self::IterationCap | Self::Unknown => 500,
        }
    }

    /// Wire code string, equal to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::TemplateError => "template_error",
            Self::AuthError => "auth_error",
            Self::TokenExchangeFailed => "token_exchange_failed",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::ModelNotFound => "model_not_found",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::PollTimeout => "poll_timeout",
            Self::Unavailable => "unavailable",
            Self::ConnectionError => "connection_error",
            Self::ServerError => "server_error",
            Self::IterationCap => "iteration_cap",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
