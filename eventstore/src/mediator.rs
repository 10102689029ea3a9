//! Mediator: fans committed events out to process-local subscribers
//! (domain handlers, the read-model projector, SSE notifiers).

use tokio::sync::broadcast;

use crate::record::EventRecord;

#[derive(Clone)]
pub struct Mediator {
    tx: broadcast::Sender<EventRecord>,
}

impl Mediator {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes one committed event. Lagging or absent subscribers are not an
    /// error; projectors recover via catch-up from their stored position.
    pub fn publish(&self, record: EventRecord) {
        let _ = self.tx.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Mediator {
    fn default() -> Self {
        Self::new(256)
    }
}
