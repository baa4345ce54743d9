//! In-process backend, lost on restart

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::LogBackend;
use crate::error::{LogError, LogResult};
use crate::event::Event;

/// Keeps events in memory; for tests and throwaway daemons
#[derive(Debug, Default)]
pub struct MemoryBackend {
    sessions: Mutex<HashMap<String, Vec<Event>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> LogError {
        LogError::Unavailable("memory backend lock poisoned".to_string())
    }
}

#[async_trait]
impl LogBackend for MemoryBackend {
    async fn write(&self, event: &Event) -> LogResult<()> {
        debug!(session_id = %event.session_id, sequence = event.sequence, "MemoryBackend::write: called");
        let mut sessions = self.sessions.lock().map_err(|_| Self::poisoned())?;
        sessions.entry(event.session_id.clone()).or_default().push(event.clone());
        Ok(())
    }

    async fn scan(&self, session_id: &str, from_sequence: u64, limit: usize) -> LogResult<Vec<Event>> {
        let sessions = self.sessions.lock().map_err(|_| Self::poisoned())?;
        let events = sessions
            .get(session_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence >= from_sequence)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }

    async fn high_water(&self, session_id: &str) -> LogResult<u64> {
        let sessions = self.sessions.lock().map_err(|_| Self::poisoned())?;
        Ok(sessions
            .get(session_id)
            .and_then(|events| events.last())
            .map(|e| e.sequence)
            .unwrap_or(0))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use chrono::Utc;

    fn event(session_id: &str, sequence: u64) -> Event {
        Event {
            session_id: session_id.to_string(),
            sequence,
            timestamp: Utc::now(),
            payload: Payload::text_delta(format!("chunk {}", sequence)),
        }
    }

    #[tokio::test]
    async fn test_scan_respects_from_and_limit() {
        let backend = MemoryBackend::new();
        for seq in 1..=5 {
            backend.write(&event("s1", seq)).await.unwrap();
        }

        let events = backend.scan("s1", 2, 2).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let backend = MemoryBackend::new();
        backend.write(&event("s1", 1)).await.unwrap();
        backend.write(&event("s2", 1)).await.unwrap();
        backend.write(&event("s2", 2)).await.unwrap();

        assert_eq!(backend.high_water("s1").await.unwrap(), 1);
        assert_eq!(backend.high_water("s2").await.unwrap(), 2);
        assert_eq!(backend.high_water("s3").await.unwrap(), 0);
        assert!(backend.scan("s3", 1, 10).await.unwrap().is_empty());
    }
}
