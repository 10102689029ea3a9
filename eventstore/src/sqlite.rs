//! SQLite-backed event store and projector position store.
//!
//! One table `events (position, stream_id, event_type, payload, version, recorded_at)`;
//! `position` is the rowid and doubles as the global order. Appends run inside a
//! transaction so the expected-version check and the insert are atomic.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::record::{EventRecord, ExpectedVersion, NewEvent};
use crate::store::{check_expected, EventStore, EventStoreError};

fn storage_err(e: impl std::fmt::Display) -> EventStoreError {
    EventStoreError::Storage(e.to_string())
}

pub struct SqliteEventStore {
    db_path: std::path::PathBuf,
}

impl SqliteEventStore {
    /// Creates the store and ensures the schema exists. `path` is the SQLite file path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, EventStoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path).map_err(storage_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                position INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                version INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                UNIQUE (stream_id, version)
            );
            CREATE INDEX IF NOT EXISTS idx_events_stream ON events(stream_id);
            "#,
        )
        .map_err(storage_err)?;
        Ok(Self { db_path })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
        let payload: String = row.get(3)?;
        let recorded_at: String = row.get(5)?;
        Ok(EventRecord {
            position: row.get::<_, i64>(0)? as u64,
            stream_id: row.get(1)?,
            event_type: row.get(2)?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            version: row.get::<_, i64>(4)? as u64,
            recorded_at: recorded_at.parse().unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventStoreError> {
        let stream_id = stream_id.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&db_path).map_err(storage_err)?;
            let tx = conn.transaction().map_err(storage_err)?;
            let current: u64 = tx
                .query_row(
                    "SELECT MAX(version) FROM events WHERE stream_id = ?1",
                    params![stream_id],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()
                .map_err(storage_err)?
                .flatten()
                .unwrap_or(0) as u64;
            check_expected(&stream_id, expected, current)?;

            let now = Utc::now().to_rfc3339();
            let mut version = current;
            for ev in events {
                version += 1;
                let payload = serde_json::to_string(&ev.payload)?;
                tx.execute(
                    "INSERT INTO events (stream_id, event_type, payload, version, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![stream_id, ev.event_type, payload, version as i64, now],
                )
                .map_err(storage_err)?;
            }
            tx.commit().map_err(storage_err)?;
            Ok::<u64, EventStoreError>(version)
        })
        .await
        .map_err(storage_err)?
    }

    async fn read_stream(&self, stream_id: &str) -> Result<Vec<EventRecord>, EventStoreError> {
        let stream_id = stream_id.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).map_err(storage_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT position, stream_id, event_type, payload, version, recorded_at
                     FROM events WHERE stream_id = ?1 ORDER BY version ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![stream_id], SqliteEventStore::row_to_record)
                .map_err(storage_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }

    async fn read_from(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).map_err(storage_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT position, stream_id, event_type, payload, version, recorded_at
                     FROM events WHERE position > ?1 ORDER BY position ASC LIMIT ?2",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(
                    params![after as i64, limit as i64],
                    SqliteEventStore::row_to_record,
                )
                .map_err(storage_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
        .await
        .map_err(storage_err)?
    }
}

/// Projector positions persisted next to the read models they guard.
pub struct SqlitePositionStore {
    db_path: std::path::PathBuf,
}

impl SqlitePositionStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, EventStoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path).map_err(storage_err)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS projection_positions (
                name TEXT PRIMARY KEY,
                position INTEGER NOT NULL
            )",
            [],
        )
        .map_err(storage_err)?;
        Ok(Self { db_path })
    }
}

#[async_trait]
impl crate::projection::PositionStore for SqlitePositionStore {
    async fn get(&self, name: &str) -> Result<u64, EventStoreError> {
        let name = name.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).map_err(storage_err)?;
            let pos: Option<i64> = conn
                .query_row(
                    "SELECT position FROM projection_positions WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            Ok(pos.unwrap_or(0) as u64)
        })
        .await
        .map_err(storage_err)?
    }

    async fn set(&self, name: &str, position: u64) -> Result<(), EventStoreError> {
        let name = name.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).map_err(storage_err)?;
            conn.execute(
                "INSERT INTO projection_positions (name, position) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET position = excluded.position",
                params![name, position as i64],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
        .map_err(storage_err)?
    }
}
