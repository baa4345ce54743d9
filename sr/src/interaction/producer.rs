//! Agent producer - the external source of raw turn output
//!
//! A producer turns a submitted message into a lazy stream of [`AgentUnit`]s.
//! Cancellation is cooperative: the producer receives a [`CancellationToken`]
//! and acknowledges by ending its stream (or yielding
//! [`ProducerError::Cancelled`]) once it notices the token.

use std::time::Duration;

use eventlog::Payload;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One raw unit of agent output
#[derive(Debug, Clone, PartialEq)]
pub enum AgentUnit {
    TextDelta(String),
    ToolCall {
        call_id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        output: String,
        is_error: bool,
    },
    SystemMessage(String),
}

impl AgentUnit {
    pub fn into_payload(self) -> Payload {
        match self {
            Self::TextDelta(text) => Payload::text_delta(text),
            Self::ToolCall {
                call_id,
                name,
                arguments,
            } => Payload::tool_call(call_id, name, arguments),
            Self::ToolResult {
                call_id,
                output,
                is_error,
            } => Payload::tool_result(call_id, output, is_error),
            Self::SystemMessage(text) => Payload::system_message(text),
        }
    }
}

/// Errors a producer can yield mid-stream
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProducerError {
    /// Acknowledges a cancellation request
    #[error("Producer cancelled")]
    Cancelled,

    #[error("Agent failed: {0}")]
    Failed(String),
}

/// Stream of units for one turn
pub type UnitStream = BoxStream<'static, Result<AgentUnit, ProducerError>>;

/// Source of agent turns
pub trait AgentProducer: Send + Sync {
    /// Begin a turn. Normal end of stream means the turn completed.
    fn submit(&self, session_id: &str, message: &str, cancel: CancellationToken) -> UnitStream;

    fn name(&self) -> &'static str;
}

/// Streams the submitted message back one word at a time
#[derive(Debug, Clone)]
pub struct EchoProducer {
    delay: Duration,
}

impl EchoProducer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoProducer {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl AgentProducer for EchoProducer {
    fn submit(&self, session_id: &str, message: &str, cancel: CancellationToken) -> UnitStream {
        debug!(%session_id, "EchoProducer::submit: called");
        let words: Vec<String> = message
            .split_whitespace()
            .enumerate()
            .map(|(i, w)| if i == 0 { w.to_string() } else { format!(" {}", w) })
            .collect();
        let delay = self.delay;

        stream::unfold(words.into_iter(), move |mut words| {
            let cancel = cancel.clone();
            async move {
                let word = words.next()?;
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    _ = tokio::time::sleep(delay) => Some((Ok(AgentUnit::TextDelta(word)), words)),
                }
            }
        })
        .boxed()
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// One step of a [`ScriptedProducer`] turn
#[derive(Debug, Clone)]
pub enum Step {
    Emit(AgentUnit),
    Sleep(Duration),
    Fail(String),
}

/// Plays a fixed script for every submission
///
/// With `ignore_cancel` set the script runs on regardless of the token, which
/// models a producer that never acknowledges cancellation.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProducer {
    steps: Vec<Step>,
    ignore_cancel: bool,
}

impl ScriptedProducer {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ignore_cancel: false,
        }
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }
}

impl AgentProducer for ScriptedProducer {
    fn submit(&self, session_id: &str, _message: &str, cancel: CancellationToken) -> UnitStream {
        debug!(%session_id, steps = self.steps.len(), "ScriptedProducer::submit: called");
        let ignore_cancel = self.ignore_cancel;

        stream::unfold(self.steps.clone().into_iter(), move |mut steps| {
            let cancel = cancel.clone();
            async move {
                loop {
                    if !ignore_cancel && cancel.is_cancelled() {
                        return Some((Err(ProducerError::Cancelled), Vec::new().into_iter()));
                    }
                    match steps.next()? {
                        Step::Emit(unit) => return Some((Ok(unit), steps)),
                        Step::Fail(message) => {
                            return Some((Err(ProducerError::Failed(message)), Vec::new().into_iter()));
                        }
                        Step::Sleep(duration) if ignore_cancel => tokio::time::sleep(duration).await,
                        Step::Sleep(duration) => {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::time::sleep(duration) => {}
                            }
                        }
                    }
                }
            }
        })
        .boxed()
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_echo_streams_words() {
        let producer = EchoProducer::new(Duration::from_millis(10));
        let units: Vec<_> = producer
            .submit("s1", "hello there world", CancellationToken::new())
            .collect()
            .await;
        assert_eq!(
            units,
            vec![
                Ok(AgentUnit::TextDelta("hello".into())),
                Ok(AgentUnit::TextDelta(" there".into())),
                Ok(AgentUnit::TextDelta(" world".into())),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_stops_on_cancel() {
        let producer = EchoProducer::new(Duration::from_secs(1));
        let token = CancellationToken::new();
        let mut stream = producer.submit("s1", "a b c d", token.clone());

        assert!(stream.next().await.is_some());
        token.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_scripted_failure_ends_stream() {
        let producer = ScriptedProducer::new(vec![
            Step::Emit(AgentUnit::SystemMessage("starting".into())),
            Step::Fail("model overloaded".into()),
            Step::Emit(AgentUnit::TextDelta("never".into())),
        ]);
        let units: Vec<_> = producer.submit("s1", "", CancellationToken::new()).collect().await;
        assert_eq!(units.len(), 2);
        assert_eq!(units[1], Err(ProducerError::Failed("model overloaded".into())));
    }

    #[tokio::test]
    async fn test_scripted_acknowledges_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let producer = ScriptedProducer::new(vec![Step::Emit(AgentUnit::TextDelta("x".into()))]);
        let units: Vec<_> = producer.submit("s1", "", token).collect().await;
        assert_eq!(units, vec![Err(ProducerError::Cancelled)]);
    }

    #[test]
    fn test_unit_payload_mapping() {
        let payload = AgentUnit::ToolResult {
            call_id: "c1".into(),
            output: "ok".into(),
            is_error: false,
        }
        .into_payload();
        assert_eq!(payload, Payload::tool_result("c1", "ok", false));
    }
}
