//! Inter-Process Communication for the control socket
//!
//! Unix Domain Socket carrying newline-delimited JSON between the `sr` CLI and
//! the daemon started by `sr serve`.

use std::path::PathBuf;

pub mod client;
pub mod listener;
pub mod messages;
pub mod server;

pub use client::{DaemonClient, FrameStream, ReplayOptions};
pub use listener::{cleanup_socket, create_listener_at};
pub use messages::{ControlCommand, Frame, Request};
pub use server::{Server, serve};

/// Default socket path for the daemon
///
/// Prefers the runtime dir, falling back to the local data dir.
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("sessionreel")
        .join("sessionreel.sock")
}
