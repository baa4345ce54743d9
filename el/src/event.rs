//! Event value type and its wire envelope
//!
//! An [`Event`] is one immutable step of agent activity within a session. The
//! same envelope is used for live delivery, history reads and replay:
//!
//! ```text
//! { "sequence": 3, "session_id": "s1", "kind": "text_delta",
//!   "timestamp": "2026-01-01T00:00:00Z", "payload": { "text": "Hel" } }
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Closed set of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TextDelta,
    ToolCall,
    ToolResult,
    SystemMessage,
    Completion,
    Cancelled,
    Error,
}

impl EventKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextDelta => "text_delta",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::SystemMessage => "system_message",
            Self::Completion => "completion",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Terminal kinds close an interaction and end a live stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completion | Self::Cancelled | Self::Error)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text_delta" => Ok(Self::TextDelta),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            "system_message" => Ok(Self::SystemMessage),
            "completion" => Ok(Self::Completion),
            "cancelled" => Ok(Self::Cancelled),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown event kind '{}'", other)),
        }
    }
}

/// A fragment of streamed assistant text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDelta {
    pub text: String,
}

/// The agent invoked a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Output of a tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
}

/// A system-level note injected into the turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub text: String,
}

/// The turn finished normally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub stop_reason: String,
}

/// The turn was cancelled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancelled {
    pub reason: String,
    /// True when the producer never acknowledged within the grace period
    #[serde(default)]
    pub forced: bool,
}

/// The turn failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
}

/// Kind-specific event data
///
/// Serializes as the bare inner struct; the kind travels beside it in the
/// envelope, so decoding goes through [`Payload::from_value`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    TextDelta(TextDelta),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    SystemMessage(SystemMessage),
    Completion(Completion),
    Cancelled(Cancelled),
    Error(ErrorDetail),
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TextDelta(_) => EventKind::TextDelta,
            Self::ToolCall(_) => EventKind::ToolCall,
            Self::ToolResult(_) => EventKind::ToolResult,
            Self::SystemMessage(_) => EventKind::SystemMessage,
            Self::Completion(_) => EventKind::Completion,
            Self::Cancelled(_) => EventKind::Cancelled,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// Decode a payload body for the given kind
    pub fn from_value(kind: EventKind, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EventKind::TextDelta => Self::TextDelta(serde_json::from_value(value)?),
            EventKind::ToolCall => Self::ToolCall(serde_json::from_value(value)?),
            EventKind::ToolResult => Self::ToolResult(serde_json::from_value(value)?),
            EventKind::SystemMessage => Self::SystemMessage(serde_json::from_value(value)?),
            EventKind::Completion => Self::Completion(serde_json::from_value(value)?),
            EventKind::Cancelled => Self::Cancelled(serde_json::from_value(value)?),
            EventKind::Error => Self::Error(serde_json::from_value(value)?),
        })
    }

    // === Convenience constructors ===

    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::TextDelta(TextDelta { text: text.into() })
    }

    pub fn tool_call(call_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCall(ToolCall {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        })
    }

    pub fn tool_result(call_id: impl Into<String>, output: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult(ToolResult {
            call_id: call_id.into(),
            output: output.into(),
            is_error,
        })
    }

    pub fn system_message(text: impl Into<String>) -> Self {
        Self::SystemMessage(SystemMessage { text: text.into() })
    }

    pub fn completion(stop_reason: impl Into<String>) -> Self {
        Self::Completion(Completion {
            stop_reason: stop_reason.into(),
        })
    }

    pub fn cancelled(reason: impl Into<String>, forced: bool) -> Self {
        Self::Cancelled(Cancelled {
            reason: reason.into(),
            forced,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorDetail {
            message: message.into(),
        })
    }
}

/// One immutable, ordered record of agent activity within a session
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Envelope")]
pub struct Event {
    pub session_id: String,
    /// Per-session, gap-free, starting at 1. The only ordering key.
    pub sequence: u64,
    /// Wall-clock time of original occurrence; used for replay pacing only
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Event", 5)?;
        state.serialize_field("sequence", &self.sequence)?;
        state.serialize_field("session_id", &self.session_id)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("payload", &self.payload)?;
        state.end()
    }
}

/// Raw wire shape, payload still undecoded
#[derive(Debug, Deserialize)]
struct Envelope {
    sequence: u64,
    session_id: String,
    kind: EventKind,
    timestamp: DateTime<Utc>,
    payload: Value,
}

impl TryFrom<Envelope> for Event {
    type Error = serde_json::Error;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        Ok(Self {
            session_id: envelope.session_id,
            sequence: envelope.sequence,
            timestamp: envelope.timestamp,
            payload: Payload::from_value(envelope.kind, envelope.payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample(payload: Payload) -> Event {
        Event {
            session_id: "s1".to_string(),
            sequence: 7,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
            payload,
        }
    }

    #[test]
    fn test_envelope_shape() {
        let event = sample(Payload::text_delta("Hel"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "sequence": 7,
                "session_id": "s1",
                "kind": "text_delta",
                "timestamp": "2026-01-01T12:00:00Z",
                "payload": { "text": "Hel" }
            })
        );
    }

    #[test]
    fn test_tool_call_decodes() {
        let json = r#"{"sequence":2,"session_id":"s1","kind":"tool_call","timestamp":"2026-01-01T12:00:00Z",
            "payload":{"call_id":"c1","name":"read_file","arguments":{"path":"/tmp/x"}}}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind(), EventKind::ToolCall);
        match event.payload {
            Payload::ToolCall(call) => {
                assert_eq!(call.name, "read_file");
                assert_eq!(call.arguments["path"], "/tmp/x");
            }
            other => panic!("Expected ToolCall, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_must_match_kind() {
        let json = r#"{"sequence":1,"session_id":"s1","kind":"tool_result","timestamp":"2026-01-01T12:00:00Z",
            "payload":{"text":"not a tool result"}}"#;
        assert!(serde_json::from_str::<Event>(json).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = r#"{"sequence":1,"session_id":"s1","kind":"thinking","timestamp":"2026-01-01T12:00:00Z",
            "payload":{}}"#;
        assert!(serde_json::from_str::<Event>(json).is_err());
    }

    #[test]
    fn test_cancelled_forced_defaults_false() {
        let payload = Payload::from_value(EventKind::Cancelled, json!({ "reason": "user" })).unwrap();
        assert_eq!(payload, Payload::cancelled("user", false));
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(EventKind::Completion.is_terminal());
        assert!(EventKind::Cancelled.is_terminal());
        assert!(EventKind::Error.is_terminal());
        assert!(!EventKind::TextDelta.is_terminal());
        assert!(!EventKind::ToolCall.is_terminal());
        assert!(!EventKind::ToolResult.is_terminal());
        assert!(!EventKind::SystemMessage.is_terminal());
    }

    #[test]
    fn test_kind_string_forms_agree() {
        for kind in [
            EventKind::TextDelta,
            EventKind::ToolCall,
            EventKind::ToolResult,
            EventKind::SystemMessage,
            EventKind::Completion,
            EventKind::Cancelled,
            EventKind::Error,
        ] {
            let serialized = serde_json::to_string(&kind).unwrap();
            assert_eq!(serialized, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<EventKind>().is_err());
    }
}
