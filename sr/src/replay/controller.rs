//! ReplayController - opens replays and keeps them addressable by id

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use eventlog::EventLog;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use super::LiveProbe;
use super::actor::{Registry, ReplayActor, ReplaySettings};
use super::handle::{ReplayHandle, ReplayStream};
use crate::error::{ReelError, ReelResult};

/// Outstanding frame requests per replay; the stream never posts a second
/// before the first is answered
const DEMAND_BUFFER: usize = 1;

/// Command queue depth per replay
const COMMAND_BUFFER: usize = 32;

/// Factory and registry for replay sessions
#[derive(Clone)]
pub struct ReplayController {
    log: Arc<EventLog>,
    live: Arc<dyn LiveProbe>,
    settings: ReplaySettings,
    registry: Registry,
}

impl ReplayController {
    pub fn new(log: Arc<EventLog>, live: Arc<dyn LiveProbe>, settings: ReplaySettings) -> Self {
        debug!(?settings, "ReplayController::new: called");
        Self {
            log,
            live,
            settings,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a replay of `session_id`: cursor 1, paused, rate 1.0
    pub fn open(&self, session_id: &str) -> (ReplayHandle, ReplayStream) {
        let replay_id = Uuid::now_v7().to_string();
        debug!(%session_id, %replay_id, "ReplayController::open: called");

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (demand_tx, demand_rx) = mpsc::channel(DEMAND_BUFFER);
        let (last_tx, last_rx) = oneshot::channel();
        let handle = ReplayHandle::new(replay_id.clone(), session_id.to_string(), cmd_tx);

        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(replay_id.clone(), handle.clone());

        let actor = ReplayActor::new(
            replay_id.clone(),
            session_id.to_string(),
            Arc::clone(&self.log),
            Arc::clone(&self.live),
            self.settings.clone(),
            cmd_rx,
            demand_rx,
            last_tx,
            Arc::clone(&self.registry),
        );
        tokio::spawn(actor.run());

        (handle, ReplayStream::new(replay_id, demand_tx, last_rx))
    }

    /// Look up an open replay
    pub fn get(&self, replay_id: &str) -> ReelResult<ReplayHandle> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(replay_id)
            .cloned()
            .ok_or_else(|| ReelError::ReplayNotFound(replay_id.to_string()))
    }

    pub fn open_count(&self) -> usize {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Close every open replay
    pub async fn close_all(&self) {
        let handles: Vec<ReplayHandle> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        debug!(count = handles.len(), "ReplayController::close_all: called");
        for handle in handles {
            handle.close().await;
        }
    }
}
