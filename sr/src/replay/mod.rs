//! Replay - paced re-delivery of a session's stored events
//!
//! Every open replay is its own actor task holding a read cursor into the
//! event log. Emission is paced by the recorded gaps between events divided by
//! the replay rate. Control (play, pause, seek, rate) goes through a
//! [`ReplayHandle`]; events come out of the paired [`ReplayStream`].

mod actor;
mod controller;
mod handle;
mod messages;

pub use actor::ReplaySettings;
pub use controller::ReplayController;
pub use handle::{ReplayHandle, ReplayStream};
pub use messages::{ReplayFrame, ReplayState, ReplayStatus};

use crate::interaction::InteractionController;

/// Tells a replay whether its session may still grow
///
/// A caught-up replay keeps polling while its session is live instead of
/// finishing.
pub trait LiveProbe: Send + Sync {
    fn is_live(&self, session_id: &str) -> bool;
}

impl LiveProbe for InteractionController {
    fn is_live(&self, session_id: &str) -> bool {
        self.is_running(session_id)
    }
}

/// Probe for logs that never grow during a replay
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverLive;

impl LiveProbe for NeverLive {
    fn is_live(&self, _session_id: &str) -> bool {
        false
    }
}
