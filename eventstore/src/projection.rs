//! Read-model projection: idempotent handlers driven live off the mediator and
//! caught up from the event store by position.
//!
//! Handlers never propagate errors; a failing handler logs and skips so the
//! projector keeps moving (a stuck projector is worse than one stale row).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;

use crate::mediator::Mediator;
use crate::record::EventRecord;
use crate::store::{EventStore, EventStoreError};

/// Persisted high-water mark per projection name.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<u64, EventStoreError>;
    async fn set(&self, name: &str, position: u64) -> Result<(), EventStoreError>;
}

#[derive(Default)]
pub struct InMemoryPositionStore {
    positions: DashMap<String, u64>,
}

impl InMemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn get(&self, name: &str) -> Result<u64, EventStoreError> {
        Ok(self.positions.get(name).map(|p| *p).unwrap_or(0))
    }

    async fn set(&self, name: &str, position: u64) -> Result<(), EventStoreError> {
        self.positions.insert(name.to_string(), position);
        Ok(())
    }
}

/// One read-model writer. `handle` must be idempotent: replaying an event the
/// read model has already absorbed must leave it unchanged.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &'static str;

    /// Applies one event. Must not fail; log-and-skip internally.
    async fn handle(&self, record: &EventRecord);

    /// Clears the read model for a full rebuild.
    async fn truncate(&self);
}

/// Drives a set of projections: catch-up from stored positions, live tail from
/// the mediator, and full rebuild.
pub struct Projector {
    store: Arc<dyn EventStore>,
    positions: Arc<dyn PositionStore>,
    projections: Vec<Arc<dyn Projection>>,
    batch_size: usize,
}

impl Projector {
    pub fn new(
        store: Arc<dyn EventStore>,
        positions: Arc<dyn PositionStore>,
        projections: Vec<Arc<dyn Projection>>,
    ) -> Self {
        Self {
            store,
            positions,
            projections,
            batch_size: 256,
        }
    }

    /// Replays every projection from its stored position to the head.
    /// Returns the highest position applied.
    pub async fn catch_up(&self) -> Result<u64, EventStoreError> {
        let mut head = 0;
        for projection in &self.projections {
            let mut position = self.positions.get(projection.name()).await?;
            loop {
                let batch = self.store.read_from(position, self.batch_size).await?;
                if batch.is_empty() {
                    break;
                }
                for record in &batch {
                    projection.handle(record).await;
                    position = record.position;
                }
                self.positions.set(projection.name(), position).await?;
            }
            head = head.max(position);
        }
        Ok(head)
    }

    /// Truncates every read model and replays from position zero.
    pub async fn rebuild(&self) -> Result<u64, EventStoreError> {
        for projection in &self.projections {
            projection.truncate().await;
            self.positions.set(projection.name(), 0).await?;
        }
        self.catch_up().await
    }

    /// Spawns the live projector task: initial catch-up, then apply events from
    /// the mediator as they are published, with a periodic reconciliation pass
    /// that re-streams from the stored position (covers lag and missed events).
    pub fn spawn(self: Arc<Self>, mediator: &Mediator) -> tokio::task::JoinHandle<()> {
        self.spawn_with_reconcile_interval(mediator, Duration::from_secs(30))
    }

    pub fn spawn_with_reconcile_interval(
        self: Arc<Self>,
        mediator: &Mediator,
        reconcile_interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = mediator.subscribe();
        tokio::spawn(async move {
            if let Err(e) = self.catch_up().await {
                tracing::error!("projector initial catch-up failed: {}", e);
            }
            let mut reconcile = tokio::time::interval(reconcile_interval);
            reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = reconcile.tick() => {
                        if let Err(e) = self.catch_up().await {
                            tracing::warn!("projector reconciliation failed: {}", e);
                        }
                    }
                    received = rx.recv() => match received {
                        Ok(record) => {
                            for projection in &self.projections {
                                let name = projection.name();
                                let last = self.positions.get(name).await.unwrap_or(0);
                                if record.position <= last {
                                    continue; // already absorbed during catch-up
                                }
                                projection.handle(&record).await;
                                if let Err(e) = self.positions.set(name, record.position).await {
                                    tracing::warn!("position store write failed for {}: {}", name, e);
                                }
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!("projector lagged by {} events, catching up", missed);
                            if let Err(e) = self.catch_up().await {
                                tracing::error!("projector catch-up failed: {}", e);
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}
