//! IPC message types for the control socket
//!
//! Newline-delimited JSON. A client writes one `Request` line per connection;
//! the daemon answers with one or more `Frame` lines.

use eventlog::Event;
use serde::{Deserialize, Serialize};

use crate::error::ReelError;
use crate::interaction::InteractionSnapshot;
use crate::replay::ReplayStatus;

/// Requests from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Begin a turn and stream its events
    Start { session_id: String, message: String },

    Cancel { session_id: String },

    /// Stream live events until the next terminal event
    Watch { session_id: String },

    History {
        session_id: String,
        #[serde(default = "first_sequence")]
        from: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    /// Open a replay and stream it on this connection
    ReplayOpen {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rate: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<i64>,
        /// Start playing right away instead of opening paused
        #[serde(default)]
        autoplay: bool,
    },

    /// Drive a replay opened on another connection
    ReplayControl { replay_id: String, command: ControlCommand },

    ReplayClose { replay_id: String },

    Status { session_id: String },

    Ping,

    Shutdown,
}

fn first_sequence() -> u64 {
    1
}

/// Replay transport commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    Play,
    Pause,
    Seek { target: i64 },
    SetRate { rate: f64 },
    Status,
}

/// Frames from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Event { event: Event },

    Events { events: Vec<Event> },

    Ack,

    CancelAck { was_running: bool, forced: bool },

    ReplayOpened { status: ReplayStatus },

    ReplayStatus { status: ReplayStatus },

    /// Last frame of a replay stream
    Finished { status: ReplayStatus },

    /// The watcher fell behind and was dropped
    Overflow,

    Interaction { snapshot: Option<InteractionSnapshot> },

    Pong { version: String },

    Error { code: String, message: String },
}

impl Frame {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&ReelError> for Frame {
    fn from(e: &ReelError) -> Self {
        Self::error(e.code(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplayState;
    use eventlog::Payload;

    #[test]
    fn test_start_deserialize() {
        let json = r#"{"type":"start","session_id":"s1","message":"hello"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            req,
            Request::Start {
                session_id: "s1".to_string(),
                message: "hello".to_string()
            }
        );
    }

    #[test]
    fn test_history_defaults() {
        let json = r#"{"type":"history","session_id":"s1"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            req,
            Request::History {
                session_id: "s1".to_string(),
                from: 1,
                limit: None
            }
        );
    }

    #[test]
    fn test_replay_open_defaults() {
        let json = r#"{"type":"replay_open","session_id":"s1"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            req,
            Request::ReplayOpen {
                session_id: "s1".to_string(),
                rate: None,
                from: None,
                autoplay: false
            }
        );
    }

    #[test]
    fn test_replay_control_serialize() {
        let req = Request::ReplayControl {
            replay_id: "r1".to_string(),
            command: ControlCommand::Seek { target: 3 },
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"type":"replay_control","replay_id":"r1","command":{"action":"seek","target":3}}"#
        );
    }

    #[test]
    fn test_set_rate_deserialize() {
        let json = r#"{"type":"replay_control","replay_id":"r1","command":{"action":"set_rate","rate":2.0}}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            req,
            Request::ReplayControl {
                replay_id: "r1".to_string(),
                command: ControlCommand::SetRate { rate: 2.0 }
            }
        );
    }

    #[test]
    fn test_ping_serialize() {
        let json = serde_json::to_string(&Request::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"type":"explode"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"type":"start","session_id":"s1"}"#).is_err());
    }

    #[test]
    fn test_ack_serialize() {
        let json = serde_json::to_string(&Frame::Ack).unwrap();
        assert_eq!(json, r#"{"type":"ack"}"#);
    }

    #[test]
    fn test_cancel_ack_serialize() {
        let frame = Frame::CancelAck {
            was_running: true,
            forced: false,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"cancel_ack","was_running":true,"forced":false}"#);
    }

    #[test]
    fn test_error_from_reel_error() {
        let frame = Frame::from(&ReelError::SessionNotFound("s9".to_string()));
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            json,
            r#"{"type":"error","code":"session_not_found","message":"Session not found: s9"}"#
        );
    }

    #[test]
    fn test_event_frame_carries_envelope() {
        let event = Event {
            session_id: "s1".to_string(),
            sequence: 4,
            timestamp: chrono::Utc::now(),
            payload: Payload::text_delta("hi"),
        };
        let frame = Frame::Event { event: event.clone() };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["sequence"], 4);
        assert_eq!(json["event"]["kind"], "text_delta");

        let parsed: Frame = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, Frame::Event { event });
    }

    #[test]
    fn test_finished_frame_round_trips() {
        let frame = Frame::Finished {
            status: ReplayStatus {
                replay_id: "r1".to_string(),
                session_id: "s1".to_string(),
                state: ReplayState::Finished,
                cursor: 6,
                rate: 1.5,
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""state":"finished""#));
        assert_eq!(serde_json::from_str::<Frame>(&json).unwrap(), frame);
    }
}
