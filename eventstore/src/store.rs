//! Event store abstraction: per-stream append with expected-version check,
//! per-stream reads, and global-order reads for projectors.

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{EventRecord, ExpectedVersion, NewEvent};

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("version conflict on {stream_id}: expected {expected:?}, actual {actual}")]
    VersionConflict {
        stream_id: String,
        expected: String,
        actual: u64,
    },
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events to a stream, enforcing the expected version.
    /// Returns the stream's new version.
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventStoreError>;

    /// Reads a full stream in version order. Empty vec when the stream does not exist.
    async fn read_stream(&self, stream_id: &str) -> Result<Vec<EventRecord>, EventStoreError>;

    /// Reads up to `limit` events with `position > after`, in global order.
    async fn read_from(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventStoreError>;
}

pub(crate) fn check_expected(
    stream_id: &str,
    expected: ExpectedVersion,
    actual: u64,
) -> Result<(), EventStoreError> {
    let ok = match expected {
        ExpectedVersion::Any => true,
        ExpectedVersion::NoStream => actual == 0,
        ExpectedVersion::Exact(v) => actual == v,
    };
    if ok {
        Ok(())
    } else {
        Err(EventStoreError::VersionConflict {
            stream_id: stream_id.to_string(),
            expected: format!("{:?}", expected),
            actual,
        })
    }
}
