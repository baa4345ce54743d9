//! Error taxonomy for the session reel service
//!
//! Every variant has a stable wire code (see [`ReelError::code`]) used by the
//! control surface in `error` frames.

use eventlog::LogError;
use thiserror::Error;

/// Errors surfaced by the broadcaster, interaction and replay controllers
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReelError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A turn is already running for the session; cancel or wait
    #[error("Interaction already in progress for session {0}")]
    InteractionInProgress(String),

    #[error("Event log unavailable: {0}")]
    LogUnavailable(String),

    /// The subscriber's delivery queue filled up and it was dropped
    #[error("Subscriber dropped: delivery queue overflowed")]
    SubscriberOverflow,

    #[error("Sequence out of range: {0} (must be >= 1)")]
    SequenceOutOfRange(i64),

    #[error("Invalid rate: {0} (must be a finite number > 0)")]
    InvalidRate(f64),

    #[error("Replay not found: {0}")]
    ReplayNotFound(String),

    #[error("Replay {0} has finished")]
    ReplayFinished(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal channel closed")]
    ChannelClosed,
}

/// Result alias for reel operations
pub type ReelResult<T> = Result<T, ReelError>;

impl ReelError {
    /// Stable snake_case code for the wire
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::InteractionInProgress(_) => "interaction_in_progress",
            Self::LogUnavailable(_) => "log_unavailable",
            Self::SubscriberOverflow => "subscriber_overflow",
            Self::SequenceOutOfRange(_) => "sequence_out_of_range",
            Self::InvalidRate(_) => "invalid_rate",
            Self::ReplayNotFound(_) => "replay_not_found",
            Self::ReplayFinished(_) => "replay_finished",
            Self::BadRequest(_) => "bad_request",
            Self::ChannelClosed => "internal",
        }
    }
}

impl From<LogError> for ReelError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::InvalidSessionId(id) => Self::SessionNotFound(id),
            other => Self::LogUnavailable(other.to_string()),
        }
    }
}
