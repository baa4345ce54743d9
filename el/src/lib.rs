//! eventlog - append-only, per-session ordered event storage
//!
//! Every session owns an independent, gap-free sequence starting at 1. The
//! [`EventLog`] assigns sequences and delegates durability to a
//! [`LogBackend`]:
//!
//! - [`MemoryBackend`] - process-local, for tests and ephemeral daemons
//! - [`JsonlBackend`] - one append-only JSONL file per session
//! - [`SqliteBackend`] - a single WAL-mode SQLite database
//!
//! # Example
//!
//! ```no_run
//! use eventlog::{EventLog, Payload};
//!
//! # async fn demo() -> eventlog::LogResult<()> {
//! let log = EventLog::in_memory();
//! let event = log.append("s1", Payload::text_delta("Hello")).await?;
//! assert_eq!(event.sequence, 1);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod event;
pub mod log;

pub use backend::{JsonlBackend, LogBackend, MemoryBackend, SqliteBackend};
pub use error::{LogError, LogResult, validate_session_id};
pub use event::{
    Cancelled, Completion, ErrorDetail, Event, EventKind, Payload, SystemMessage, TextDelta, ToolCall, ToolResult,
};
pub use log::EventLog;
