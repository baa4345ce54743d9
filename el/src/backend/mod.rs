//! Durable stores behind the event log
//!
//! A backend is a key-ordered store keyed by `(session_id, sequence)`. It does
//! not assign sequences; [`crate::EventLog`] does that and hands the backend
//! fully formed events.

use async_trait::async_trait;

use crate::error::LogResult;
use crate::event::Event;

mod jsonl;
mod memory;
mod sqlite;

pub use jsonl::JsonlBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Storage contract required by the event log
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Durably store one event. Returns only once the event is readable.
    async fn write(&self, event: &Event) -> LogResult<()>;

    /// Events with `sequence >= from_sequence`, ascending, at most `limit`
    async fn scan(&self, session_id: &str, from_sequence: u64, limit: usize) -> LogResult<Vec<Event>>;

    /// Highest stored sequence for the session, 0 if none
    async fn high_water(&self, session_id: &str) -> LogResult<u64>;

    /// Short name for logs and diagnostics
    fn name(&self) -> &'static str;
}
