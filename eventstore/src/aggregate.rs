//! Aggregate root wrapper: load a stream, fold events into state, register new
//! events, and commit them with the version observed at load time.
//!
//! State types implement [`Aggregate`]; events are internally tagged serde enums
//! so the `type` field becomes the stored `event_type`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::mediator::Mediator;
use crate::record::{ExpectedVersion, NewEvent};
use crate::store::{EventStore, EventStoreError};

/// Left-fold state for one aggregate type.
pub trait Aggregate: Default + Send + Sync {
    /// Internally tagged event enum (`#[serde(tag = "type")]`).
    type Event: Serialize + DeserializeOwned + Send + Sync;

    /// Stream prefix, e.g. `"conversation"` for streams named `conversation-{id}`.
    fn aggregate_type() -> &'static str;

    /// Applies one event to the state. Must be total: unknown payload shapes
    /// have already been filtered out by deserialization.
    fn apply(&mut self, event: &Self::Event);
}

/// Aggregate instance plus stream bookkeeping and uncommitted events.
pub struct AggregateRoot<A: Aggregate> {
    pub id: String,
    pub state: A,
    version: u64,
    pending: Vec<A::Event>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Fresh aggregate with no history.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: A::default(),
            version: 0,
            pending: Vec::new(),
        }
    }

    pub fn stream_id_for(id: &str) -> String {
        format!("{}-{}", A::aggregate_type(), id)
    }

    pub fn stream_id(&self) -> String {
        Self::stream_id_for(&self.id)
    }

    /// Version of the last committed event (0 when the stream is new).
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pending_events(&self) -> &[A::Event] {
        &self.pending
    }

    /// Registers an event: applies it to state and buffers it for commit.
    pub fn register(&mut self, event: A::Event) {
        self.state.apply(&event);
        self.pending.push(event);
    }

    /// Loads an aggregate by folding its stream. `None` when the stream is empty.
    pub async fn load(
        store: &dyn EventStore,
        id: &str,
    ) -> Result<Option<Self>, EventStoreError> {
        let records = store.read_stream(&Self::stream_id_for(id)).await?;
        if records.is_empty() {
            return Ok(None);
        }
        let mut state = A::default();
        let mut version = 0;
        for record in &records {
            // Skip events this build no longer understands rather than failing the load.
            match serde_json::from_value::<A::Event>(record.payload.clone()) {
                Ok(event) => state.apply(&event),
                Err(e) => {
                    tracing::warn!(
                        stream_id = %record.stream_id,
                        event_type = %record.event_type,
                        "skipping undecodable event during fold: {}", e
                    );
                }
            }
            version = record.version;
        }
        Ok(Some(Self {
            id: id.to_string(),
            state,
            version,
            pending: Vec::new(),
        }))
    }

    /// Appends pending events with the expected version observed at load, then
    /// publishes them through the mediator. No-op when nothing is pending.
    pub async fn commit(
        &mut self,
        store: &dyn EventStore,
        mediator: Option<&Mediator>,
    ) -> Result<(), EventStoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut new_events = Vec::with_capacity(self.pending.len());
        for event in &self.pending {
            let payload = serde_json::to_value(event)?;
            let event_type = payload
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            new_events.push(NewEvent::new(event_type, payload));
        }
        let expected = if self.version == 0 {
            ExpectedVersion::NoStream
        } else {
            ExpectedVersion::Exact(self.version)
        };
        let stream_id = self.stream_id();
        let count = new_events.len() as u64;
        let new_version = store.append(&stream_id, expected, new_events).await?;

        if let Some(mediator) = mediator {
            let first_version = new_version - count + 1;
            let records = store.read_stream(&stream_id).await?;
            for record in records.into_iter().filter(|r| r.version >= first_version) {
                mediator.publish(record);
            }
        }
        self.version = new_version;
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEventStore;
    use serde::Deserialize;

    #[derive(Default)]
    struct Counter {
        total: i64,
    }

    #[derive(Serialize, Deserialize)]
    #[serde(tag = "type")]
    enum CounterEvent {
        Incremented { by: i64 },
        Reset,
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;

        fn aggregate_type() -> &'static str {
            "counter"
        }

        fn apply(&mut self, event: &Self::Event) {
            match event {
                CounterEvent::Incremented { by } => self.total += by,
                CounterEvent::Reset => self.total = 0,
            }
        }
    }

    #[tokio::test]
    async fn register_commit_load_folds_to_same_state() {
        let store = InMemoryEventStore::new();
        let mut root = AggregateRoot::<Counter>::new("c1");
        root.register(CounterEvent::Incremented { by: 2 });
        root.register(CounterEvent::Incremented { by: 3 });
        assert_eq!(root.state.total, 5);
        root.commit(&store, None).await.unwrap();
        assert_eq!(root.version(), 2);

        let loaded = AggregateRoot::<Counter>::load(&store, "c1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.state.total, 5);
        assert_eq!(loaded.version(), 2);
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let store = InMemoryEventStore::new();
        assert!(AggregateRoot::<Counter>::load(&store, "absent")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stale_root_commit_conflicts() {
        let store = InMemoryEventStore::new();
        let mut first = AggregateRoot::<Counter>::new("c2");
        first.register(CounterEvent::Incremented { by: 1 });
        first.commit(&store, None).await.unwrap();

        let mut stale = AggregateRoot::<Counter>::new("c2");
        stale.register(CounterEvent::Reset);
        let err = stale.commit(&store, None).await.unwrap_err();
        assert!(matches!(err, EventStoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn commit_publishes_through_mediator() {
        let store = InMemoryEventStore::new();
        let mediator = Mediator::new(16);
        let mut rx = mediator.subscribe();

        let mut root = AggregateRoot::<Counter>::new("c3");
        root.register(CounterEvent::Incremented { by: 7 });
        root.commit(&store, Some(&mediator)).await.unwrap();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.stream_id, "counter-c3");
        assert_eq!(record.event_type, "Incremented");
        assert_eq!(record.payload["by"], 7);
    }
}
