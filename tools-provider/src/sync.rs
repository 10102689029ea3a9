//! Source synchronization: re-ingest descriptors and reconcile the tool
//! inventory through aggregate commands (discover / update / deprecate /
//! restore), driving health bookkeeping on the source.

use std::sync::Arc;
use std::time::Duration;

use eventstore::{EventStore, Mediator};
use thiserror::Error;

use crate::adapters::{AdapterError, AdapterFactory};
use crate::catalog::Catalog;
use crate::domain::{SourceTool, ToolStatus, UpstreamSource};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source not found: {0}")]
    SourceNotFound(String),
    #[error("source is disabled: {0}")]
    SourceDisabled(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Default, Clone)]
pub struct SyncOutcome {
    pub discovered: usize,
    pub updated: usize,
    pub deprecated: usize,
    pub restored: usize,
    pub unchanged: usize,
    pub warnings: Vec<String>,
}

pub struct SyncService {
    store: Arc<dyn EventStore>,
    mediator: Mediator,
    adapters: AdapterFactory,
    catalog: Arc<Catalog>,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn EventStore>,
        mediator: Mediator,
        adapters: AdapterFactory,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            store,
            mediator,
            adapters,
            catalog,
        }
    }

    /// One full sync pass for a source. Sync failures are recorded on the
    /// aggregate (driving health) and returned.
    pub async fn sync_source(&self, source_id: &str) -> Result<SyncOutcome, SyncError> {
        let mut source = UpstreamSource::load(self.store.as_ref(), source_id)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?
            .ok_or_else(|| SyncError::SourceNotFound(source_id.to_string()))?;
        if !source.state().is_enabled {
            return Err(SyncError::SourceDisabled(source_id.to_string()));
        }

        let adapter = self.adapters.for_source_type(source.state().source_type);
        let ingestion = match adapter
            .fetch_and_normalize(
                source_id,
                &source.state().descriptor_url,
                &source.state().auth_config,
                &source.state().default_audience,
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                source.record_sync_failure(e.to_string());
                source
                    .commit(self.store.as_ref(), Some(&self.mediator))
                    .await
                    .map_err(|se| SyncError::Store(se.to_string()))?;
                return Err(e.into());
            }
        };

        let mut outcome = SyncOutcome {
            warnings: ingestion.warnings.clone(),
            ..Default::default()
        };

        if ingestion.inventory_hash == source.state().inventory_hash {
            // Inventory unchanged: refresh the sync timestamp only.
            outcome.unchanged = ingestion.tools.len();
            source.record_sync_success(ingestion.inventory_hash, ingestion.tools.len());
            source
                .commit(self.store.as_ref(), Some(&self.mediator))
                .await
                .map_err(|e| SyncError::Store(e.to_string()))?;
            return Ok(outcome);
        }

        let mut seen: std::collections::BTreeSet<String> = Default::default();
        for definition in &ingestion.tools {
            let operation_id = definition.name.clone();
            let tool_id = SourceTool::tool_id(source_id, &operation_id);
            seen.insert(tool_id.clone());

            match SourceTool::load(self.store.as_ref(), &tool_id)
                .await
                .map_err(|e| SyncError::Store(e.to_string()))?
            {
                None => {
                    let mut tool =
                        SourceTool::discover(source_id, &operation_id, definition.clone());
                    tool.commit(self.store.as_ref(), Some(&self.mediator))
                        .await
                        .map_err(|e| SyncError::Store(e.to_string()))?;
                    outcome.discovered += 1;
                }
                Some(mut tool) => {
                    let changed = if tool.state().status == ToolStatus::Deprecated {
                        outcome.restored += 1;
                        tool.restore(definition.clone())
                    } else if tool.update_definition(definition.clone()) {
                        outcome.updated += 1;
                        true
                    } else {
                        outcome.unchanged += 1;
                        false
                    };
                    if changed {
                        tool.commit(self.store.as_ref(), Some(&self.mediator))
                            .await
                            .map_err(|e| SyncError::Store(e.to_string()))?;
                    }
                }
            }
        }

        // Tools missing from the new inventory get deprecated.
        for row in self.catalog.tools_for_source(source_id) {
            if seen.contains(&row.tool_id) || row.state.status == ToolStatus::Deprecated {
                continue;
            }
            if let Some(mut tool) = SourceTool::load(self.store.as_ref(), &row.tool_id)
                .await
                .map_err(|e| SyncError::Store(e.to_string()))?
            {
                if tool.deprecate() {
                    tool.commit(self.store.as_ref(), Some(&self.mediator))
                        .await
                        .map_err(|e| SyncError::Store(e.to_string()))?;
                    outcome.deprecated += 1;
                }
            }
        }

        source.record_sync_success(ingestion.inventory_hash, ingestion.tools.len());
        source
            .commit(self.store.as_ref(), Some(&self.mediator))
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;

        tracing::info!(
            source_id,
            discovered = outcome.discovered,
            updated = outcome.updated,
            deprecated = outcome.deprecated,
            restored = outcome.restored,
            "source sync finished"
        );
        Ok(outcome)
    }

    /// Spawns the periodic re-sync task over all known sources.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for source_id in self.catalog.source_ids() {
                    if let Err(e) = self.sync_source(&source_id).await {
                        tracing::warn!(source_id = %source_id, "sync failed: {}", e);
                    }
                }
            }
        })
    }
}
