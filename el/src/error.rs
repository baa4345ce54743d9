//! Event log error types

use thiserror::Error;

/// Errors from event log operations
#[derive(Debug, Error)]
pub enum LogError {
    /// The durable store could not accept or serve the request
    #[error("Event log unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Corrupt event log for session {session_id}: {message}")]
    Corrupt { session_id: String, message: String },
}

/// Result alias for event log operations
pub type LogResult<T> = Result<T, LogError>;

impl From<std::io::Error> for LogError {
    fn from(e: std::io::Error) -> Self {
        Self::Unavailable(format!("I/O error: {}", e))
    }
}

impl From<rusqlite::Error> for LogError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(format!("SQLite error: {}", e))
    }
}

impl From<serde_json::Error> for LogError {
    fn from(e: serde_json::Error) -> Self {
        Self::Unavailable(format!("Encoding error: {}", e))
    }
}

impl From<tokio::task::JoinError> for LogError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Unavailable(format!("Storage task failed: {}", e))
    }
}

/// Check that a session id is usable as a storage key
///
/// Ids become path components in the JSONL backend, so they are restricted to
/// `[A-Za-z0-9_.-]` and may not be `.` or `..`.
pub fn validate_session_id(session_id: &str) -> LogResult<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id != "."
        && session_id != ".."
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(LogError::InvalidSessionId(session_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_session_ids() {
        for id in ["s1", "session-01", "abc_DEF.9", "0192f3e4-7b7a-7cc0-9e5c-3c1f2a1b0d11"] {
            assert!(validate_session_id(id).is_ok(), "{} should be valid", id);
        }
    }

    #[test]
    fn test_invalid_session_ids() {
        let long = "x".repeat(129);
        for id in ["", ".", "..", "a/b", "../etc", "has space", "tab\t", long.as_str()] {
            assert!(
                matches!(validate_session_id(id), Err(LogError::InvalidSessionId(_))),
                "{:?} should be invalid",
                id
            );
        }
    }

    #[test]
    fn test_io_error_maps_to_unavailable() {
        let err: LogError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(matches!(err, LogError::Unavailable(msg) if msg.contains("disk full")));
    }
}
