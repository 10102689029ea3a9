//! Event records: what gets appended and what gets read back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event to append: type tag plus JSON payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: Value,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// A stored event: stream-local version plus a store-global position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    /// Global, strictly increasing append order across all streams.
    pub position: u64,
    pub stream_id: String,
    pub event_type: String,
    pub payload: Value,
    /// 1-based, strictly increasing within the stream.
    pub version: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Optimistic-concurrency expectation for an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check; append at whatever the current version is.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream's current version must equal this value.
    Exact(u64),
}
