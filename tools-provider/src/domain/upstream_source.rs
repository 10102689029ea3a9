//! UpstreamSource aggregate: a registered descriptor endpoint (OpenAPI or MCP)
//! whose inventory is periodically re-synced.

use chrono::{DateTime, Utc};
use eventstore::{Aggregate, AggregateRoot, EventStore, EventStoreError, Mediator};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::auth_config::AuthConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Openapi,
    Mcp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamSourceEvent {
    SourceRegistered {
        name: String,
        descriptor_url: String,
        source_type: SourceType,
        auth_config: AuthConfig,
        default_audience: String,
        registered_at: DateTime<Utc>,
    },
    SourceEnabled {
        enabled_at: DateTime<Utc>,
    },
    SourceDisabled {
        reason: Option<String>,
        disabled_at: DateTime<Utc>,
    },
    SourceSyncSucceeded {
        inventory_hash: String,
        inventory_count: usize,
        synced_at: DateTime<Utc>,
    },
    SourceSyncFailed {
        error: String,
        failed_at: DateTime<Utc>,
    },
    SourceDeleted {
        deleted_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct UpstreamSourceState {
    pub name: String,
    pub descriptor_url: String,
    pub source_type: SourceType,
    pub auth_config: AuthConfig,
    pub default_audience: String,
    pub is_enabled: bool,
    pub inventory_hash: String,
    pub inventory_count: usize,
    pub consecutive_failures: u32,
    pub synced_once: bool,
    pub deleted: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub registered_at: Option<DateTime<Utc>>,
}

impl UpstreamSourceState {
    /// Health derives from the failure counter: fresh sources are unknown,
    /// 1-2 consecutive failures degrade, 3+ mark unhealthy.
    pub fn health(&self) -> SourceHealth {
        match (self.synced_once, self.consecutive_failures) {
            (false, 0) => SourceHealth::Unknown,
            (_, 0) => SourceHealth::Healthy,
            (_, 1..=2) => SourceHealth::Degraded,
            _ => SourceHealth::Unhealthy,
        }
    }
}

impl Aggregate for UpstreamSourceState {
    type Event = UpstreamSourceEvent;

    fn aggregate_type() -> &'static str {
        "upstream_source"
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            UpstreamSourceEvent::SourceRegistered {
                name,
                descriptor_url,
                source_type,
                auth_config,
                default_audience,
                registered_at,
            } => {
                self.name = name.clone();
                self.descriptor_url = descriptor_url.clone();
                self.source_type = *source_type;
                self.auth_config = auth_config.clone();
                self.default_audience = default_audience.clone();
                self.is_enabled = true;
                self.registered_at = Some(*registered_at);
            }
            UpstreamSourceEvent::SourceEnabled { .. } => {
                self.is_enabled = true;
            }
            UpstreamSourceEvent::SourceDisabled { .. } => {
                self.is_enabled = false;
            }
            UpstreamSourceEvent::SourceSyncSucceeded {
                inventory_hash,
                inventory_count,
                synced_at,
            } => {
                self.inventory_hash = inventory_hash.clone();
                self.inventory_count = *inventory_count;
                self.consecutive_failures = 0;
                self.synced_once = true;
                self.last_synced_at = Some(*synced_at);
            }
            UpstreamSourceEvent::SourceSyncFailed { .. } => {
                self.consecutive_failures += 1;
            }
            UpstreamSourceEvent::SourceDeleted { .. } => {
                self.deleted = true;
                self.is_enabled = false;
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamSourceError {
    #[error("source has been deleted")]
    Deleted,
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

pub struct UpstreamSource {
    root: AggregateRoot<UpstreamSourceState>,
}

impl UpstreamSource {
    pub fn register(
        id: impl Into<String>,
        name: impl Into<String>,
        descriptor_url: impl Into<String>,
        source_type: SourceType,
        auth_config: AuthConfig,
        default_audience: impl Into<String>,
    ) -> Self {
        let mut root = AggregateRoot::new(id);
        root.register(UpstreamSourceEvent::SourceRegistered {
            name: name.into(),
            descriptor_url: descriptor_url.into(),
            source_type,
            auth_config,
            default_audience: default_audience.into(),
            registered_at: Utc::now(),
        });
        Self { root }
    }

    pub async fn load(
        store: &dyn EventStore,
        id: &str,
    ) -> Result<Option<Self>, UpstreamSourceError> {
        Ok(AggregateRoot::load(store, id).await?.map(|root| Self { root }))
    }

    pub async fn commit(
        &mut self,
        store: &dyn EventStore,
        mediator: Option<&Mediator>,
    ) -> Result<(), UpstreamSourceError> {
        self.root.commit(store, mediator).await?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.root.id
    }

    pub fn state(&self) -> &UpstreamSourceState {
        &self.root.state
    }

    fn ensure_live(&self) -> Result<(), UpstreamSourceError> {
        if self.root.state.deleted {
            Err(UpstreamSourceError::Deleted)
        } else {
            Ok(())
        }
    }

    pub fn enable(&mut self) -> Result<bool, UpstreamSourceError> {
        self.ensure_live()?;
        if self.root.state.is_enabled {
            return Ok(false);
        }
        self.root.register(UpstreamSourceEvent::SourceEnabled {
            enabled_at: Utc::now(),
        });
        Ok(true)
    }

    /// Disabling excludes every tool of this source from the catalog.
    pub fn disable(&mut self, reason: Option<String>) -> Result<bool, UpstreamSourceError> {
        self.ensure_live()?;
        if !self.root.state.is_enabled {
            return Ok(false);
        }
        self.root.register(UpstreamSourceEvent::SourceDisabled {
            reason,
            disabled_at: Utc::now(),
        });
        Ok(true)
    }

    pub fn record_sync_success(&mut self, inventory_hash: impl Into<String>, inventory_count: usize) {
        self.root.register(UpstreamSourceEvent::SourceSyncSucceeded {
            inventory_hash: inventory_hash.into(),
            inventory_count,
            synced_at: Utc::now(),
        });
    }

    pub fn record_sync_failure(&mut self, error: impl Into<String>) {
        self.root.register(UpstreamSourceEvent::SourceSyncFailed {
            error: error.into(),
            failed_at: Utc::now(),
        });
    }

    pub fn mark_deleted(&mut self) -> Result<(), UpstreamSourceError> {
        self.ensure_live()?;
        self.root.register(UpstreamSourceEvent::SourceDeleted {
            deleted_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore::InMemoryEventStore;

    fn source() -> UpstreamSource {
        UpstreamSource::register(
            "src1",
            "petstore",
            "https://petstore.example.com/openapi.json",
            SourceType::Openapi,
            AuthConfig::None,
            "petstore-api",
        )
    }

    #[test]
    fn registration_enables_with_unknown_health() {
        let src = source();
        assert!(src.state().is_enabled);
        assert_eq!(src.state().health(), SourceHealth::Unknown);
    }

    #[test]
    fn health_tracks_consecutive_failures() {
        let mut src = source();
        src.record_sync_success("abc123", 4);
        assert_eq!(src.state().health(), SourceHealth::Healthy);
        src.record_sync_failure("timeout");
        assert_eq!(src.state().health(), SourceHealth::Degraded);
        src.record_sync_failure("timeout");
        assert_eq!(src.state().health(), SourceHealth::Degraded);
        src.record_sync_failure("timeout");
        assert_eq!(src.state().health(), SourceHealth::Unhealthy);
        // A success resets the counter.
        src.record_sync_success("abc124", 4);
        assert_eq!(src.state().health(), SourceHealth::Healthy);
        assert_eq!(src.state().consecutive_failures, 0);
    }

    #[test]
    fn disable_after_disable_is_a_no_op() {
        let mut src = source();
        assert!(src.disable(Some("flaky".into())).unwrap());
        assert!(!src.disable(None).unwrap());
        assert!(src.enable().unwrap());
        assert!(!src.enable().unwrap());
    }

    #[test]
    fn deleted_source_rejects_commands() {
        let mut src = source();
        src.mark_deleted().unwrap();
        assert!(matches!(src.enable(), Err(UpstreamSourceError::Deleted)));
        assert!(!src.state().is_enabled);
    }

    #[tokio::test]
    async fn replay_reproduces_state() {
        let store = InMemoryEventStore::new();
        let mut src = source();
        src.record_sync_success("hash1", 7);
        src.record_sync_failure("net");
        src.commit(&store, None).await.unwrap();

        let loaded = UpstreamSource::load(&store, "src1").await.unwrap().unwrap();
        assert_eq!(loaded.state().inventory_hash, "hash1");
        assert_eq!(loaded.state().inventory_count, 7);
        assert_eq!(loaded.state().consecutive_failures, 1);
        assert_eq!(loaded.state().health(), SourceHealth::Degraded);
    }
}
