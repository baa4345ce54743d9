//! Socket helpers for the daemon side
//!
//! Binding and cleanup of the Unix Domain Socket plus line framing for
//! requests and frames.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tracing::{debug, warn};

use super::messages::{Frame, Request};
use crate::error::{ReelError, ReelResult};

/// Create and bind the control socket at `socket_path`
///
/// Creates the parent directory and removes a stale socket from a previous run.
pub fn create_listener_at(socket_path: &Path) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener_at: creating control socket");

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    if socket_path.exists() {
        debug!(?socket_path, "create_listener_at: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind control socket")?;
    debug!(?socket_path, "create_listener_at: socket bound");

    Ok((listener, socket_path.to_path_buf()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Read one request line of at most `max_bytes`
///
/// `Ok(None)` when the client closed without sending anything.
pub async fn read_request<R>(reader: &mut R, max_bytes: usize) -> ReelResult<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(max_bytes as u64 + 1);
    let bytes_read = limited
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| ReelError::BadRequest(format!("failed to read request: {e}")))?;

    if bytes_read == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.len() > max_bytes {
        return Err(ReelError::BadRequest(format!("request exceeds {max_bytes} bytes")));
    }

    let request: Request =
        serde_json::from_slice(&line).map_err(|e| ReelError::BadRequest(format!("invalid request: {e}")))?;
    debug!(?request, "read_request: parsed request");
    Ok(Some(request))
}

/// Write one frame followed by a newline
pub async fn send_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(frame).context("Failed to serialize frame")?;
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write frame")?;
    writer.write_all(b"\n").await.context("Failed to write newline")?;
    writer.flush().await.context("Failed to flush frame")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_create_listener_creates_parent_dir() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("subdir").join("sessionreel.sock");

        let (_, path) = create_listener_at(&socket_path).unwrap();
        assert_eq!(path, socket_path);
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_create_listener_removes_stale_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("sessionreel.sock");
        std::fs::write(&socket_path, "stale").unwrap();

        assert!(create_listener_at(&socket_path).is_ok());
    }

    #[test]
    fn test_cleanup_socket_removes_file() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("sessionreel.sock");
        std::fs::write(&socket_path, "test").unwrap();

        cleanup_socket(&socket_path);
        assert!(!socket_path.exists());
    }

    #[test]
    fn test_cleanup_socket_handles_missing_file() {
        let temp = TempDir::new().unwrap();
        cleanup_socket(&temp.path().join("nonexistent.sock"));
    }

    #[tokio::test]
    async fn test_read_request_parses_line() {
        let mut reader = BufReader::new(&b"{\"type\":\"ping\"}\n"[..]);
        let request = read_request(&mut reader, 1024).await.unwrap();
        assert_eq!(request, Some(Request::Ping));
    }

    #[tokio::test]
    async fn test_read_request_without_newline() {
        let mut reader = BufReader::new(&b"{\"type\":\"shutdown\"}"[..]);
        let request = read_request(&mut reader, 1024).await.unwrap();
        assert_eq!(request, Some(Request::Shutdown));
    }

    #[tokio::test]
    async fn test_read_request_eof() {
        let mut reader = BufReader::new(&b""[..]);
        assert_eq!(read_request(&mut reader, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_request_too_large() {
        let line = format!("{{\"type\":\"start\",\"session_id\":\"s1\",\"message\":\"{}\"}}\n", "x".repeat(200));
        let mut reader = BufReader::new(line.as_bytes());
        let result = read_request(&mut reader, 64).await;
        assert!(matches!(result, Err(ReelError::BadRequest(msg)) if msg.contains("exceeds")));
    }

    #[tokio::test]
    async fn test_read_request_malformed() {
        let mut reader = BufReader::new(&b"not json\n"[..]);
        let result = read_request(&mut reader, 1024).await;
        assert!(matches!(result, Err(ReelError::BadRequest(_))));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_read_request_rejects_without_panicking(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    let mut reader = BufReader::new(&bytes[..]);
                    match read_request(&mut reader, 64).await {
                        Ok(None) => prop_assert!(bytes.is_empty()),
                        Ok(Some(_)) | Err(ReelError::BadRequest(_)) => {}
                        Err(other) => prop_assert!(false, "unexpected error: {:?}", other),
                    }
                    Ok(())
                })?;
            }

            #[test]
            fn prop_oversize_lines_are_refused(extra in 1usize..200) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    let line = format!("{}\n", "x".repeat(64 + extra));
                    let mut reader = BufReader::new(line.as_bytes());
                    let result = read_request(&mut reader, 64).await;
                    prop_assert!(matches!(result, Err(ReelError::BadRequest(msg)) if msg.contains("exceeds")));
                    Ok(())
                })?;
            }
        }
    }

    #[tokio::test]
    async fn test_send_frame_appends_newline() {
        let mut out = Vec::new();
        send_frame(&mut out, &Frame::Ack).await.unwrap();
        assert_eq!(out, b"{\"type\":\"ack\"}\n");
    }
}
