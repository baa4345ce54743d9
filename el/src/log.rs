//! EventLog - per-session sequence assignment over a durable backend
//!
//! Each session has its own head cell holding the highest assigned sequence.
//! Appends for one session serialize on that cell; different sessions never
//! contend with each other here. The head is loaded lazily from the backend,
//! so a restarted process continues where the store left off.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

use crate::backend::{LogBackend, MemoryBackend};
use crate::error::{LogError, LogResult, validate_session_id};
use crate::event::{Event, EventKind, Payload};

/// Highest sequence assigned for a session; `None` until loaded from the store
#[derive(Debug, Default)]
struct Head {
    latest: Option<u64>,
}

/// Append-only, per-session ordered store of events
pub struct EventLog {
    backend: Arc<dyn LogBackend>,
    heads: Mutex<HashMap<String, Arc<AsyncMutex<Head>>>>,
}

impl EventLog {
    pub fn new(backend: Arc<dyn LogBackend>) -> Self {
        debug!(backend = backend.name(), "EventLog::new: called");
        Self {
            backend,
            heads: Mutex::new(HashMap::new()),
        }
    }

    /// Event log over a fresh in-memory backend
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn head(&self, session_id: &str) -> LogResult<Arc<AsyncMutex<Head>>> {
        let mut heads = self
            .heads
            .lock()
            .map_err(|_| LogError::Unavailable("head table lock poisoned".to_string()))?;
        Ok(Arc::clone(heads.entry(session_id.to_string()).or_default()))
    }

    async fn load(&self, session_id: &str, head: &mut Head) -> LogResult<u64> {
        match head.latest {
            Some(latest) => Ok(latest),
            None => {
                let latest = self.backend.high_water(session_id).await?;
                debug!(%session_id, latest, "EventLog: loaded head from backend");
                head.latest = Some(latest);
                Ok(latest)
            }
        }
    }

    /// Append an event stamped with the current time
    pub async fn append(&self, session_id: &str, payload: Payload) -> LogResult<Event> {
        self.append_at(session_id, payload, Utc::now()).await
    }

    /// Append an event with a caller-supplied occurrence time
    ///
    /// The next sequence is assigned atomically with the write. When the write
    /// fails the store is asked what it holds: a record that landed anyway is
    /// reported as appended, otherwise the error is returned. Either way the
    /// next append follows the stored high-water mark, so no gap appears.
    pub async fn append_at(&self, session_id: &str, payload: Payload, timestamp: DateTime<Utc>) -> LogResult<Event> {
        debug!(%session_id, kind = %payload.kind(), "EventLog::append: called");
        validate_session_id(session_id)?;

        let cell = self.head(session_id)?;
        let mut head = cell.lock().await;
        let latest = self.load(session_id, &mut head).await?;

        let event = Event {
            session_id: session_id.to_string(),
            sequence: latest + 1,
            timestamp,
            payload,
        };

        match self.backend.write(&event).await {
            Ok(()) => {
                head.latest = Some(event.sequence);
                Ok(event)
            }
            Err(e) => {
                error!(%session_id, sequence = event.sequence, error = %e, "EventLog: durable write failed");
                // A write can fail after its record reached the store; trust the store
                match self.backend.high_water(session_id).await {
                    Ok(stored) if stored >= event.sequence => {
                        warn!(%session_id, sequence = event.sequence, "EventLog: failed write was stored, keeping it");
                        head.latest = Some(stored);
                        Ok(event)
                    }
                    Ok(stored) => {
                        head.latest = Some(stored);
                        Err(e)
                    }
                    Err(_) => {
                        head.latest = None;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Events with `sequence >= from_sequence`, ascending, at most `limit`
    ///
    /// A caught-up reader gets an empty list, not an error. `from_sequence` 0
    /// reads from the start.
    pub async fn read(&self, session_id: &str, from_sequence: u64, limit: usize) -> LogResult<Vec<Event>> {
        debug!(%session_id, from_sequence, limit, "EventLog::read: called");
        validate_session_id(session_id)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let events = self.backend.scan(session_id, from_sequence.max(1), limit).await?;

        if let Some(pair) = events.windows(2).find(|w| w[1].sequence != w[0].sequence + 1) {
            warn!(%session_id, before = pair[0].sequence, after = pair[1].sequence, "EventLog::read: sequence gap in store");
        }
        Ok(events)
    }

    /// Current high-water mark, 0 if the session has no events
    pub async fn latest_sequence(&self, session_id: &str) -> LogResult<u64> {
        debug!(%session_id, "EventLog::latest_sequence: called");
        validate_session_id(session_id)?;
        let cell = self.head(session_id)?;
        let mut head = cell.lock().await;
        self.load(session_id, &mut head).await
    }

    /// Kind of the last event in the session, if any
    pub async fn trailing_kind(&self, session_id: &str) -> LogResult<Option<EventKind>> {
        debug!(%session_id, "EventLog::trailing_kind: called");
        let latest = self.latest_sequence(session_id).await?;
        if latest == 0 {
            return Ok(None);
        }
        let events = self.backend.scan(session_id, latest, 1).await?;
        Ok(events.first().map(Event::kind))
    }
}
