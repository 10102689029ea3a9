//! In-memory event store for tests and single-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::record::{EventRecord, ExpectedVersion, NewEvent};
use crate::store::{check_expected, EventStore, EventStoreError};

/// Single global log guarded by one lock; stream reads filter by stream_id.
/// Appends across streams serialize, which also gives a total global order.
#[derive(Default, Clone)]
pub struct InMemoryEventStore {
    log: Arc<Mutex<Vec<EventRecord>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events across all streams.
    pub async fn len(&self) -> usize {
        self.log.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.lock().await.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventStoreError> {
        let mut log = self.log.lock().await;
        let current = log
            .iter()
            .filter(|r| r.stream_id == stream_id)
            .map(|r| r.version)
            .max()
            .unwrap_or(0);
        check_expected(stream_id, expected, current)?;

        let mut position = log.len() as u64;
        let mut version = current;
        let now = Utc::now();
        for ev in events {
            position += 1;
            version += 1;
            log.push(EventRecord {
                position,
                stream_id: stream_id.to_string(),
                event_type: ev.event_type,
                payload: ev.payload,
                version,
                recorded_at: now,
            });
        }
        Ok(version)
    }

    async fn read_stream(&self, stream_id: &str) -> Result<Vec<EventRecord>, EventStoreError> {
        let log = self.log.lock().await;
        Ok(log
            .iter()
            .filter(|r| r.stream_id == stream_id)
            .cloned()
            .collect())
    }

    async fn read_from(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let log = self.log.lock().await;
        Ok(log
            .iter()
            .filter(|r| r.position > after)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_assigns_versions_and_positions() {
        let store = InMemoryEventStore::new();
        let v = store
            .append(
                "conversation-1",
                ExpectedVersion::NoStream,
                vec![
                    NewEvent::new("Created", json!({})),
                    NewEvent::new("MessageAdded", json!({"role": "user"})),
                ],
            )
            .await
            .unwrap();
        assert_eq!(v, 2);

        let events = store.read_stream("conversation-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].version, 1);
        assert_eq!(events[1].version, 2);
        assert!(events[0].position < events[1].position);
    }

    #[tokio::test]
    async fn expected_version_conflict_rejected() {
        let store = InMemoryEventStore::new();
        store
            .append(
                "conversation-1",
                ExpectedVersion::NoStream,
                vec![NewEvent::new("Created", json!({}))],
            )
            .await
            .unwrap();

        let err = store
            .append(
                "conversation-1",
                ExpectedVersion::NoStream,
                vec![NewEvent::new("Created", json!({}))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::VersionConflict { .. }));

        let err = store
            .append(
                "conversation-1",
                ExpectedVersion::Exact(5),
                vec![NewEvent::new("MessageAdded", json!({}))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::VersionConflict { actual: 1, .. }));
    }

    #[tokio::test]
    async fn read_from_returns_global_order_across_streams() {
        let store = InMemoryEventStore::new();
        store
            .append("a-1", ExpectedVersion::Any, vec![NewEvent::new("E1", json!({}))])
            .await
            .unwrap();
        store
            .append("b-1", ExpectedVersion::Any, vec![NewEvent::new("E2", json!({}))])
            .await
            .unwrap();
        store
            .append("a-1", ExpectedVersion::Any, vec![NewEvent::new("E3", json!({}))])
            .await
            .unwrap();

        let all = store.read_from(0, 100).await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.event_type.as_str()).collect::<Vec<_>>(),
            vec!["E1", "E2", "E3"]
        );
        let tail = store.read_from(1, 100).await.unwrap();
        assert_eq!(tail.len(), 2);
    }
}
