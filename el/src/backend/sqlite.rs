//! SQLite backend - all sessions in one `events` table
//!
//! `PRIMARY KEY (session_id, sequence)` enforces per-session uniqueness at the
//! database level. rusqlite is blocking, so every call hops onto the blocking
//! pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, info};

use super::LogBackend;
use crate::error::{LogError, LogResult};
use crate::event::{Event, EventKind, Payload};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    session_id TEXT NOT NULL,
    sequence   INTEGER NOT NULL,
    timestamp  TEXT NOT NULL,
    kind       TEXT NOT NULL,
    payload    TEXT NOT NULL,
    PRIMARY KEY (session_id, sequence)
) WITHOUT ROWID;
";

/// Event store backed by a single SQLite database file
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> LogResult<Self> {
        let path = path.as_ref();
        debug!(?path, "SqliteBackend::open: called");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        info!(?path, journal_mode = %mode, "Opened SQLite event log");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> LogResult<Self> {
        debug!("SqliteBackend::open_in_memory: called");
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> LogResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> LogResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| LogError::Unavailable("sqlite connection lock poisoned".to_string()))?;
            f(&*conn)
        })
        .await?
    }
}

fn decode_row(
    session_id: &str,
    sequence: i64,
    timestamp: &str,
    kind: &str,
    payload: &str,
) -> LogResult<Event> {
    let corrupt = |message: String| LogError::Corrupt {
        session_id: session_id.to_string(),
        message,
    };
    let kind: EventKind = kind.parse().map_err(corrupt)?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| corrupt(format!("bad timestamp at {}: {}", sequence, e)))?
        .with_timezone(&Utc);
    let value = serde_json::from_str(payload).map_err(|e| corrupt(format!("bad payload at {}: {}", sequence, e)))?;
    let payload =
        Payload::from_value(kind, value).map_err(|e| corrupt(format!("payload/kind mismatch at {}: {}", sequence, e)))?;
    Ok(Event {
        session_id: session_id.to_string(),
        sequence: sequence as u64,
        timestamp,
        payload,
    })
}

#[async_trait]
impl LogBackend for SqliteBackend {
    async fn write(&self, event: &Event) -> LogResult<()> {
        debug!(session_id = %event.session_id, sequence = event.sequence, "SqliteBackend::write: called");
        let session_id = event.session_id.clone();
        let sequence = event.sequence as i64;
        let timestamp = event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true);
        let kind = event.kind().as_str();
        let payload = serde_json::to_string(&event.payload)?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO events (session_id, sequence, timestamp, kind, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, sequence, timestamp, kind, payload],
            )?;
            Ok(())
        })
        .await
    }

    async fn scan(&self, session_id: &str, from_sequence: u64, limit: usize) -> LogResult<Vec<Event>> {
        debug!(%session_id, from_sequence, limit, "SqliteBackend::scan: called");
        let session_id = session_id.to_string();
        let from = from_sequence.min(i64::MAX as u64) as i64;
        let limit = limit.min(i64::MAX as usize) as i64;

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT sequence, timestamp, kind, payload FROM events
                 WHERE session_id = ?1 AND sequence >= ?2
                 ORDER BY sequence ASC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![session_id, from, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (sequence, timestamp, kind, payload) = row?;
                events.push(decode_row(&session_id, sequence, &timestamp, &kind, &payload)?);
            }
            Ok(events)
        })
        .await
    }

    async fn high_water(&self, session_id: &str) -> LogResult<u64> {
        debug!(%session_id, "SqliteBackend::high_water: called");
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let latest: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            Ok(latest as u64)
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn event(session_id: &str, sequence: u64, payload: Payload) -> Event {
        Event {
            session_id: session_id.to_string(),
            sequence,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_write_and_scan_preserves_events() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let written = vec![
            event("s1", 1, Payload::text_delta("hi")),
            event("s1", 2, Payload::tool_call("c1", "grep", json!({"pattern": "todo"}))),
            event("s1", 3, Payload::tool_result("c1", "3 matches", false)),
            event("s1", 4, Payload::completion("end_turn")),
        ];
        for e in &written {
            backend.write(e).await.unwrap();
        }

        let read = backend.scan("s1", 1, 100).await.unwrap();
        assert_eq!(read, written);
        assert_eq!(backend.high_water("s1").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_sequence_rejected() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.write(&event("s1", 1, Payload::text_delta("a"))).await.unwrap();
        let dup = backend.write(&event("s1", 1, Payload::text_delta("b"))).await;
        assert!(matches!(dup, Err(LogError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_scan_limit_and_offset() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for seq in 1..=10 {
            backend.write(&event("s1", seq, Payload::text_delta("x"))).await.unwrap();
        }
        let seqs: Vec<u64> = backend
            .scan("s1", 4, 3)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events.db");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.write(&event("s1", 1, Payload::text_delta("a"))).await.unwrap();
        }
        let backend = SqliteBackend::open(&path).unwrap();
        assert_eq!(backend.high_water("s1").await.unwrap(), 1);
        assert_eq!(backend.high_water("s2").await.unwrap(), 0);
    }
}
