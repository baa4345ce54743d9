//! Replay messages
//!
//! Commands and responses for the replay actor.

use eventlog::Event;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ReelResult;

/// Replay transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    Paused,
    Playing,
    Finished,
}

/// What a control call reports back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayStatus {
    pub replay_id: String,
    pub session_id: String,
    pub state: ReplayState,
    /// Next sequence the consumer has not yet been handed
    pub cursor: u64,
    pub rate: f64,
}

/// Item of a replay's output stream
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayFrame {
    Event(Event),
    /// Last frame; the replay has emitted everything and the session is idle
    Finished(ReplayStatus),
}

/// One pending request for the next frame, posted by the stream
pub(crate) type FrameRequest = oneshot::Sender<ReplayFrame>;

/// Reply channel for commands that answer with a status
pub(crate) type StatusReply = oneshot::Sender<ReelResult<ReplayStatus>>;

/// Commands sent to a replay actor
#[derive(Debug)]
pub(crate) enum ReplayCommand {
    Play { reply: StatusReply },
    Pause { reply: StatusReply },
    Seek { target: i64, reply: StatusReply },
    SetRate { rate: f64, reply: StatusReply },
    Status { reply: StatusReply },
    Close { reply: oneshot::Sender<()> },
}
