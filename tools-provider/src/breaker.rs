//! Per-source circuit breaker: CLOSED / OPEN / HALF_OPEN.
//!
//! Failures are network errors and 5xx responses; 4xx responses pass through
//! without counting. State changes can be published for observability.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot for observability endpoints and state-change events.
#[derive(Clone, Debug, Serialize)]
pub struct BreakerSnapshot {
    pub circuit_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub manual_reset: bool,
}

pub type StateChangeListener = Arc<dyn Fn(BreakerSnapshot) + Send + Sync>;

struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    /// True while a half-open probe is in flight.
    probing: bool,
}

pub struct CircuitBreaker {
    circuit_id: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    listener: Option<StateChangeListener>,
}

/// Why a call was rejected without invoking the wrapped function.
#[derive(Debug, thiserror::Error)]
#[error("circuit open for {circuit_id}")]
pub struct CircuitOpen {
    pub circuit_id: String,
}

impl CircuitBreaker {
    pub fn new(
        circuit_id: impl Into<String>,
        config: BreakerConfig,
        listener: Option<StateChangeListener>,
    ) -> Self {
        Self {
            circuit_id: circuit_id.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                probing: false,
            }),
            listener,
        }
    }

    fn notify(&self, inner: &Inner, manual_reset: bool) {
        if let Some(listener) = &self.listener {
            listener(BreakerSnapshot {
                circuit_id: self.circuit_id.clone(),
                state: inner.state,
                failure_count: inner.failure_count,
                manual_reset,
            });
        }
    }

    /// Gate check before the protected call. `Err` means fail fast.
    pub async fn acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probing = true;
                    self.notify(&inner, false);
                    tracing::info!(circuit_id = %self.circuit_id, "circuit half-open, probing");
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        circuit_id: self.circuit_id.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probing {
                    // One probe at a time.
                    Err(CircuitOpen {
                        circuit_id: self.circuit_id.clone(),
                    })
                } else {
                    inner.probing = true;
                    Ok(())
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        let was = inner.state;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probing = false;
        if was != CircuitState::Closed {
            self.notify(&inner, false);
            tracing::info!(circuit_id = %self.circuit_id, "circuit closed");
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.probing = false;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                self.notify(&inner, false);
                tracing::warn!(circuit_id = %self.circuit_id, "probe failed, circuit re-opened");
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    self.notify(&inner, false);
                    tracing::warn!(
                        circuit_id = %self.circuit_id,
                        failures = inner.failure_count,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn reset(&self, manual: bool) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probing = false;
        self.notify(&inner, manual);
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        BreakerSnapshot {
            circuit_id: self.circuit_id.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            manual_reset: false,
        }
    }
}

/// Registry: one breaker per source id (or URL when no source id exists).
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    listener: Option<StateChangeListener>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, listener: Option<StateChangeListener>) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            listener,
        }
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("source:{}", key),
                    self.config.clone(),
                    self.listener.clone(),
                ))
            })
            .clone()
    }

    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out = Vec::new();
        for entry in self.breakers.iter() {
            out.push(entry.value().snapshot().await);
        }
        out
    }

    pub async fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset(true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "source:test",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
            },
            None,
        )
    }

    #[tokio::test]
    async fn opens_at_failure_threshold_and_fails_fast() {
        let cb = breaker(3, Duration::from_secs(30));
        for _ in 0..3 {
            cb.acquire().await.unwrap();
            cb.record_failure().await;
        }
        assert_eq!(cb.snapshot().await.state, CircuitState::Open);
        // Fails fast without invoking the wrapped call.
        assert!(cb.acquire().await.is_err());
    }

    #[tokio::test]
    async fn four_xx_equivalent_successes_keep_circuit_closed() {
        let cb = breaker(2, Duration::from_secs(30));
        cb.acquire().await.unwrap();
        cb.record_failure().await;
        cb.acquire().await.unwrap();
        cb.record_success().await;
        let snap = cb.snapshot().await;
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[tokio::test]
    async fn recovery_timeout_allows_single_probe() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.acquire().await.unwrap();
        cb.record_failure().await;
        assert!(cb.acquire().await.is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        // First caller becomes the probe; a second concurrent caller is rejected.
        cb.acquire().await.unwrap();
        assert!(cb.acquire().await.is_err());

        cb.record_success().await;
        assert_eq!(cb.snapshot().await.state, CircuitState::Closed);
        cb.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.acquire().await.unwrap();
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cb.acquire().await.unwrap();
        cb.record_failure().await;
        assert_eq!(cb.snapshot().await.state, CircuitState::Open);
        assert!(cb.acquire().await.is_err());
    }

    #[tokio::test]
    async fn manual_reset_closes_and_notifies() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb = CircuitBreaker::new(
            "source:observed",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(30),
            },
            Some(Arc::new(move |snap: BreakerSnapshot| {
                sink.lock().unwrap().push(snap);
            })),
        );
        cb.acquire().await.unwrap();
        cb.record_failure().await;
        cb.reset(true).await;
        assert_eq!(cb.snapshot().await.state, CircuitState::Closed);
        let events = seen.lock().unwrap();
        assert!(events.iter().any(|s| s.state == CircuitState::Open));
        assert!(events.iter().any(|s| s.manual_reset));
    }

    #[tokio::test]
    async fn registry_hands_out_one_breaker_per_source() {
        let registry = BreakerRegistry::new(BreakerConfig::default(), None);
        let a1 = registry.get("src-a");
        let a2 = registry.get("src-a");
        let b = registry.get("src-b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}
