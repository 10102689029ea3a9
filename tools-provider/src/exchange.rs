//! RFC 8693 token exchange with a per-(subject, audience, scopes) cache and
//! single-flight refresh.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_core::ErrorKind;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const SUBJECT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
/// Cached tokens are considered stale this long before actual expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TokenExchangeError {
    #[error("token endpoint unreachable: {0}")]
    Transport(String),
    #[error("token exchange rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("token endpoint returned malformed response: {0}")]
    Malformed(String),
    #[error("token exchange is not configured")]
    NotConfigured,
}

impl TokenExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::ConnectionError,
            Self::Rejected { status, .. } if *status >= 500 => ErrorKind::ServerError,
            Self::Rejected { .. } => ErrorKind::TokenExchangeFailed,
            Self::Malformed(_) => ErrorKind::TokenExchangeFailed,
            Self::NotConfigured => ErrorKind::TokenExchangeFailed,
        }
    }

    /// Retryable on 5xx/network only, never on 4xx.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[derive(Clone, Debug)]
pub struct ExchangeConfig {
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    /// Hard cap on cached-token lifetime regardless of `expires_in`.
    pub cache_cap: Duration,
}

struct CachedToken {
    access_token: String,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ExchangerState {
    pub cached_tokens: usize,
    pub exchanges: u64,
    pub cache_hits: u64,
    pub failures: u64,
}

/// Per-key entry: cached token plus a single-flight lock so concurrent callers
/// coalesce on one refresh.
#[derive(Default)]
struct Entry {
    token: Mutex<Option<CachedToken>>,
}

pub struct TokenExchanger {
    config: Option<ExchangeConfig>,
    http: reqwest::Client,
    cache: DashMap<String, Arc<Entry>>,
    exchanges: std::sync::atomic::AtomicU64,
    cache_hits: std::sync::atomic::AtomicU64,
    failures: std::sync::atomic::AtomicU64,
}

impl TokenExchanger {
    pub fn new(config: Option<ExchangeConfig>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            cache: DashMap::new(),
            exchanges: Default::default(),
            cache_hits: Default::default(),
            failures: Default::default(),
        }
    }

    /// Cache key over the subject token, audience, and scopes. The raw token
    /// never becomes a map key.
    fn cache_key(subject_token: &str, audience: &str, scopes: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(subject_token.as_bytes());
        hasher.update(b"\x00");
        hasher.update(audience.as_bytes());
        hasher.update(b"\x00");
        hasher.update(scopes.join(" ").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Exchanges the subject token for an audience-scoped access token,
    /// serving cached tokens while they are fresh.
    pub async fn exchange(
        &self,
        subject_token: &str,
        audience: &str,
        scopes: &[String],
    ) -> Result<String, TokenExchangeError> {
        let config = self
            .config
            .as_ref()
            .ok_or(TokenExchangeError::NotConfigured)?;

        let key = Self::cache_key(subject_token, audience, scopes);
        let entry = self
            .cache
            .entry(key)
            .or_insert_with(|| Arc::new(Entry::default()))
            .clone();

        let mut guard = entry.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.is_fresh() {
                self.cache_hits
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Ok(cached.access_token.clone());
            }
        }

        let result = self
            .do_exchange(config, subject_token, audience, scopes)
            .await;
        match result {
            Ok((access_token, expires_in)) => {
                self.exchanges
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let ttl = expires_in
                    .saturating_sub(EXPIRY_MARGIN)
                    .min(config.cache_cap);
                *guard = Some(CachedToken {
                    access_token: access_token.clone(),
                    fetched_at: Instant::now(),
                    ttl,
                });
                Ok(access_token)
            }
            Err(e) => {
                self.failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn do_exchange(
        &self,
        config: &ExchangeConfig,
        subject_token: &str,
        audience: &str,
        scopes: &[String],
    ) -> Result<(String, Duration), TokenExchangeError> {
        let scope = scopes.join(" ");
        let mut form = vec![
            ("grant_type", GRANT_TYPE),
            ("subject_token", subject_token),
            ("subject_token_type", SUBJECT_TOKEN_TYPE),
            ("audience", audience),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let response = self
            .http
            .post(&config.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| TokenExchangeError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TokenExchangeError::Transport(e.to_string()))?;
        if status != 200 {
            return Err(TokenExchangeError::Rejected {
                status,
                body: body.chars().take(200).collect(),
            });
        }
        let data: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| TokenExchangeError::Malformed(e.to_string()))?;
        let access_token = data
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TokenExchangeError::Malformed("missing access_token".into()))?
            .to_string();
        let expires_in = data
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(300);
        Ok((access_token, Duration::from_secs(expires_in)))
    }

    pub fn get_state(&self) -> ExchangerState {
        ExchangerState {
            cached_tokens: self.cache.len(),
            exchanges: self.exchanges.load(std::sync::atomic::Ordering::Relaxed),
            cache_hits: self.cache_hits.load(std::sync::atomic::Ordering::Relaxed),
            failures: self.failures.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_separates_subject_audience_and_scopes() {
        let base = TokenExchanger::cache_key("token-a", "aud-1", &[]);
        assert_ne!(base, TokenExchanger::cache_key("token-b", "aud-1", &[]));
        assert_ne!(base, TokenExchanger::cache_key("token-a", "aud-2", &[]));
        assert_ne!(
            base,
            TokenExchanger::cache_key("token-a", "aud-1", &["read".into()])
        );
        assert_eq!(base, TokenExchanger::cache_key("token-a", "aud-1", &[]));
    }

    #[test]
    fn rejected_4xx_is_not_retryable_but_5xx_is() {
        let unauthorized = TokenExchangeError::Rejected {
            status: 401,
            body: "invalid subject".into(),
        };
        assert!(!unauthorized.is_retryable());
        assert_eq!(unauthorized.kind(), ErrorKind::TokenExchangeFailed);

        let upstream = TokenExchangeError::Rejected {
            status: 502,
            body: "bad gateway".into(),
        };
        assert!(upstream.is_retryable());

        let network = TokenExchangeError::Transport("connection refused".into());
        assert!(network.is_retryable());
    }

    #[tokio::test]
    async fn unconfigured_exchanger_errors() {
        let exchanger = TokenExchanger::new(None);
        let err = exchanger.exchange("tok", "aud", &[]).await.unwrap_err();
        assert!(matches!(err, TokenExchangeError::NotConfigured));
    }

    #[test]
    fn cached_token_freshness() {
        let fresh = CachedToken {
            access_token: "t".into(),
            fetched_at: Instant::now(),
            ttl: Duration::from_secs(60),
        };
        assert!(fresh.is_fresh());
        let stale = CachedToken {
            access_token: "t".into(),
            fetched_at: Instant::now() - Duration::from_secs(61),
            ttl: Duration::from_secs(60),
        };
        assert!(!stale.is_fresh());
    }
}
