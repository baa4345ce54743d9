//! IPC client for talking to the daemon
//!
//! Unary calls (ping, cancel, history, ...) send one request and read one
//! frame under a timeout. Streaming calls (start, watch, replay) return a
//! [`FrameStream`] that yields frames until the daemon ends the stream.

use std::path::PathBuf;
use std::time::Duration;

use eventlog::Event;
use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tracing::debug;

use super::get_socket_path;
use super::messages::{ControlCommand, Frame, Request};
use crate::interaction::{CancelOutcome, InteractionSnapshot};
use crate::replay::ReplayStatus;

/// Default timeout for unary IPC operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for opening a replay over the socket
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub rate: Option<f64>,
    pub from: Option<i64>,
    pub autoplay: bool,
}

/// Turn an `error` frame into an eyre error
fn daemon_error(frame: Frame) -> eyre::Report {
    match frame {
        Frame::Error { code, message } => eyre::eyre!("Daemon error ({}): {}", code, message),
        other => eyre::eyre!("Unexpected response: {:?}", other),
    }
}

/// Frames arriving on a streaming connection
pub struct FrameStream {
    lines: Lines<BufReader<UnixStream>>,
}

impl FrameStream {
    /// Next frame; `Ok(None)` when the daemon closed the stream
    ///
    /// An `error` frame is returned as `Err`.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(line) = self.lines.next_line().await.context("Failed to read frame")? else {
            return Ok(None);
        };
        let frame: Frame = serde_json::from_str(line.trim()).context("Failed to parse frame")?;
        match frame {
            Frame::Error { .. } => Err(daemon_error(frame)),
            frame => Ok(Some(frame)),
        }
    }
}

/// Client for the daemon's control socket
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient {
    /// Create a new client with the default socket path
    pub fn new() -> Self {
        Self::with_socket_path(get_socket_path())
    }

    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check the daemon is alive and get its version
    pub async fn ping(&self) -> Result<String> {
        debug!("DaemonClient: pinging daemon");
        match self.send_message(Request::Ping).await? {
            Frame::Pong { version } => Ok(version),
            other => Err(daemon_error(other)),
        }
    }

    /// Request daemon to shut down gracefully
    pub async fn shutdown(&self) -> Result<()> {
        debug!("DaemonClient: requesting daemon shutdown");
        match self.send_message(Request::Shutdown).await? {
            Frame::Ack => Ok(()),
            other => Err(daemon_error(other)),
        }
    }

    pub async fn cancel(&self, session_id: &str) -> Result<CancelOutcome> {
        debug!(%session_id, "DaemonClient: cancel");
        let request = Request::Cancel {
            session_id: session_id.to_string(),
        };
        match self.send_message(request).await? {
            Frame::CancelAck {
                was_running: true,
                forced,
            } => Ok(CancelOutcome::Cancelled { forced }),
            Frame::CancelAck { was_running: false, .. } => Ok(CancelOutcome::NotRunning),
            other => Err(daemon_error(other)),
        }
    }

    pub async fn history(&self, session_id: &str, from: u64, limit: Option<usize>) -> Result<Vec<Event>> {
        debug!(%session_id, from, ?limit, "DaemonClient: history");
        let request = Request::History {
            session_id: session_id.to_string(),
            from,
            limit,
        };
        match self.send_message(request).await? {
            Frame::Events { events } => Ok(events),
            other => Err(daemon_error(other)),
        }
    }

    pub async fn status(&self, session_id: &str) -> Result<Option<InteractionSnapshot>> {
        let request = Request::Status {
            session_id: session_id.to_string(),
        };
        match self.send_message(request).await? {
            Frame::Interaction { snapshot } => Ok(snapshot),
            other => Err(daemon_error(other)),
        }
    }

    pub async fn replay_control(&self, replay_id: &str, command: ControlCommand) -> Result<ReplayStatus> {
        debug!(%replay_id, ?command, "DaemonClient: replay control");
        let request = Request::ReplayControl {
            replay_id: replay_id.to_string(),
            command,
        };
        match self.send_message(request).await? {
            Frame::ReplayStatus { status } => Ok(status),
            other => Err(daemon_error(other)),
        }
    }

    pub async fn replay_close(&self, replay_id: &str) -> Result<()> {
        let request = Request::ReplayClose {
            replay_id: replay_id.to_string(),
        };
        match self.send_message(request).await? {
            Frame::Ack => Ok(()),
            other => Err(daemon_error(other)),
        }
    }

    /// Start a turn and stream its events
    pub async fn start(&self, session_id: &str, message: &str) -> Result<FrameStream> {
        debug!(%session_id, "DaemonClient: start");
        self.open_stream(Request::Start {
            session_id: session_id.to_string(),
            message: message.to_string(),
        })
        .await
    }

    /// Watch live events; returns once the daemon confirmed the subscription
    pub async fn watch(&self, session_id: &str) -> Result<FrameStream> {
        debug!(%session_id, "DaemonClient: watch");
        let mut stream = self
            .open_stream(Request::Watch {
                session_id: session_id.to_string(),
            })
            .await?;
        match self.first_frame(&mut stream).await? {
            Frame::Ack => Ok(stream),
            other => Err(daemon_error(other)),
        }
    }

    /// Open a replay; the stream carries its events then `finished`
    pub async fn replay_open(&self, session_id: &str, options: ReplayOptions) -> Result<(ReplayStatus, FrameStream)> {
        debug!(%session_id, ?options, "DaemonClient: replay open");
        let mut stream = self
            .open_stream(Request::ReplayOpen {
                session_id: session_id.to_string(),
                rate: options.rate,
                from: options.from,
                autoplay: options.autoplay,
            })
            .await?;
        match self.first_frame(&mut stream).await? {
            Frame::ReplayOpened { status } => Ok((status, stream)),
            other => Err(daemon_error(other)),
        }
    }

    async fn first_frame(&self, stream: &mut FrameStream) -> Result<Frame> {
        tokio::time::timeout(self.timeout, stream.next_frame())
            .await
            .context("Read timeout")??
            .ok_or_else(|| eyre::eyre!("Daemon closed the connection"))
    }

    async fn connect_and_send(&self, request: &Request) -> Result<UnixStream> {
        debug!(?self.socket_path, ?request, "DaemonClient: sending request");
        let mut stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to daemon socket")?;

        let json = serde_json::to_string(request).context("Failed to serialize request")?;
        tokio::time::timeout(self.timeout, async {
            stream
                .write_all(json.as_bytes())
                .await
                .context("Failed to write request")?;
            stream.write_all(b"\n").await.context("Failed to write newline")?;
            stream.flush().await.context("Failed to flush stream")?;
            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Write timeout")??;

        Ok(stream)
    }

    async fn open_stream(&self, request: Request) -> Result<FrameStream> {
        let stream = self.connect_and_send(&request).await?;
        Ok(FrameStream {
            lines: BufReader::new(stream).lines(),
        })
    }

    /// Send a request and wait for its single frame
    async fn send_message(&self, request: Request) -> Result<Frame> {
        let stream = self.connect_and_send(&request).await?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        tokio::time::timeout(self.timeout, reader.read_line(&mut line))
            .await
            .context("Read timeout")?
            .context("Failed to read response")?;

        if line.is_empty() {
            return Err(eyre::eyre!("Daemon closed the connection"));
        }
        let frame: Frame = serde_json::from_str(line.trim()).context("Failed to parse daemon response")?;
        debug!(?frame, "DaemonClient: received frame");
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_client_default() {
        let client = DaemonClient::default();
        assert!(client.socket_path.ends_with("sessionreel.sock"));
    }

    #[test]
    fn test_client_with_custom_path() {
        let path = PathBuf::from("/custom/path/sessionreel.sock");
        let client = DaemonClient::with_socket_path(path.clone());
        assert_eq!(client.socket_path, path);
    }

    #[test]
    fn test_client_with_timeout() {
        let client = DaemonClient::new().with_timeout(Duration::from_secs(3));
        assert_eq!(client.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_socket_exists_false() {
        let temp = TempDir::new().unwrap();
        let client = DaemonClient::with_socket_path(temp.path().join("nonexistent.sock"));
        assert!(!client.socket_exists());
    }

    #[tokio::test]
    async fn test_ping_without_daemon_fails() {
        let temp = TempDir::new().unwrap();
        let client = DaemonClient::with_socket_path(temp.path().join("nonexistent.sock"));
        assert!(client.ping().await.is_err());
    }

    #[test]
    fn test_daemon_error_carries_code() {
        let err = daemon_error(Frame::error("replay_not_found", "Replay not found: r1"));
        assert!(err.to_string().contains("replay_not_found"));
    }
}
