//! Reel - the service facade
//!
//! Bundles the event log, broadcaster, interaction and replay controllers
//! behind one cloneable handle. Every operation checks the session directory
//! first.

use std::sync::Arc;

use eventlog::{Event, EventLog, JsonlBackend, LogBackend, MemoryBackend, SqliteBackend};
use eyre::{Context, Result};
use tracing::{debug, info};

use crate::broadcast::{Broadcaster, Subscription};
use crate::config::{Config, StorageBackend, StorageConfig};
use crate::directory::{self, SessionDirectory};
use crate::error::{ReelError, ReelResult};
use crate::interaction::{
    AgentProducer, CancelOutcome, EchoProducer, InteractionController, InteractionSnapshot, StartedInteraction,
};
use crate::replay::{ReplayController, ReplayHandle, ReplaySettings, ReplayStream};

/// Open the event log described by the storage config
pub fn open_log(storage: &StorageConfig) -> Result<EventLog> {
    let backend: Arc<dyn LogBackend> = match storage.backend {
        StorageBackend::Memory => Arc::new(MemoryBackend::new()),
        StorageBackend::Jsonl => {
            let path = storage.resolved_path();
            Arc::new(JsonlBackend::open(&path).context(format!("Failed to open JSONL log at {}", path.display()))?)
        }
        StorageBackend::Sqlite => {
            let path = storage.resolved_path();
            Arc::new(SqliteBackend::open(&path).context(format!("Failed to open SQLite log at {}", path.display()))?)
        }
    };
    Ok(EventLog::new(backend))
}

/// Cloneable handle to the whole session event service
#[derive(Clone)]
pub struct Reel {
    log: Arc<EventLog>,
    broadcaster: Broadcaster,
    interactions: InteractionController,
    replays: ReplayController,
    directory: Arc<dyn SessionDirectory>,
    history_max_limit: usize,
}

impl Reel {
    /// Assemble a reel from explicit parts; tuning comes from `config`
    pub fn new(
        log: Arc<EventLog>,
        producer: Arc<dyn AgentProducer>,
        directory: Arc<dyn SessionDirectory>,
        config: &Config,
    ) -> Self {
        debug!(backend = log.backend_name(), producer = producer.name(), "Reel::new: called");
        let broadcaster = Broadcaster::new(config.broadcast.queue_capacity);
        let interactions = InteractionController::new(
            Arc::clone(&log),
            broadcaster.clone(),
            producer,
            config.interaction.cancel_grace(),
        );
        let replays = ReplayController::new(
            Arc::clone(&log),
            Arc::new(interactions.clone()),
            ReplaySettings::from(&config.replay),
        );
        Self {
            log,
            broadcaster,
            interactions,
            replays,
            directory,
            history_max_limit: config.history.max_limit.max(1),
        }
    }

    /// Build the daemon's reel: configured store, echo producer, configured directory
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let log = open_log(&config.storage)?;
        info!(backend = log.backend_name(), "Event log ready");
        let producer = Arc::new(EchoProducer::new(config.interaction.echo_delay()));
        let directory: Arc<dyn SessionDirectory> = Arc::from(directory::from_config(&config.sessions));
        Ok(Self::new(Arc::new(log), producer, directory, config))
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    async fn ensure_session(&self, session_id: &str) -> ReelResult<()> {
        if self.directory.exists(session_id).await {
            Ok(())
        } else {
            debug!(%session_id, "Reel: unknown session");
            Err(ReelError::SessionNotFound(session_id.to_string()))
        }
    }

    /// Start a turn; the returned subscription sees every event of it
    pub async fn start(&self, session_id: &str, message: &str) -> ReelResult<StartedInteraction> {
        debug!(%session_id, "Reel::start: called");
        self.ensure_session(session_id).await?;
        self.interactions.start(session_id, message)
    }

    /// Cancel the running turn; `NotRunning` when idle
    pub async fn cancel(&self, session_id: &str) -> ReelResult<CancelOutcome> {
        debug!(%session_id, "Reel::cancel: called");
        self.ensure_session(session_id).await?;
        Ok(self.interactions.cancel(session_id).await)
    }

    /// Live view of events appended from now on
    pub async fn watch(&self, session_id: &str) -> ReelResult<Subscription> {
        debug!(%session_id, "Reel::watch: called");
        self.ensure_session(session_id).await?;
        Ok(self.broadcaster.subscribe(session_id))
    }

    /// Stored events from `from_sequence`; `limit` is capped by `history.max-limit`
    pub async fn history(&self, session_id: &str, from_sequence: u64, limit: Option<usize>) -> ReelResult<Vec<Event>> {
        debug!(%session_id, from_sequence, ?limit, "Reel::history: called");
        self.ensure_session(session_id).await?;
        let limit = limit.unwrap_or(self.history_max_limit).min(self.history_max_limit);
        Ok(self.log.read(session_id, from_sequence, limit).await?)
    }

    pub async fn latest_sequence(&self, session_id: &str) -> ReelResult<u64> {
        self.ensure_session(session_id).await?;
        Ok(self.log.latest_sequence(session_id).await?)
    }

    /// Open a paused replay at sequence 1
    pub async fn open_replay(&self, session_id: &str) -> ReelResult<(ReplayHandle, ReplayStream)> {
        debug!(%session_id, "Reel::open_replay: called");
        self.ensure_session(session_id).await?;
        Ok(self.replays.open(session_id))
    }

    /// Address an open replay by id
    pub fn replay(&self, replay_id: &str) -> ReelResult<ReplayHandle> {
        self.replays.get(replay_id)
    }

    /// Current or most recent interaction
    pub async fn status(&self, session_id: &str) -> ReelResult<Option<InteractionSnapshot>> {
        self.ensure_session(session_id).await?;
        Ok(self.interactions.status(session_id))
    }

    /// Cancel running turns and close replays
    pub async fn shutdown(&self) {
        info!("Reel shutting down");
        self.interactions.shutdown().await;
        self.replays.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::interaction::{AgentUnit, ScriptedProducer, Step};
    use tempfile::tempdir;

    fn reel(steps: Vec<Step>) -> Reel {
        Reel::new(
            Arc::new(EventLog::in_memory()),
            Arc::new(ScriptedProducer::new(steps)),
            Arc::new(StaticDirectory::new(["s1"])),
            &Config::default(),
        )
    }

    #[tokio::test]
    async fn test_unknown_session_rejected_everywhere() {
        let reel = reel(vec![]);
        assert!(matches!(reel.start("nope", "hi").await, Err(ReelError::SessionNotFound(_))));
        assert!(matches!(reel.cancel("nope").await, Err(ReelError::SessionNotFound(_))));
        assert!(matches!(reel.watch("nope").await, Err(ReelError::SessionNotFound(_))));
        assert!(matches!(reel.history("nope", 1, None).await, Err(ReelError::SessionNotFound(_))));
        assert!(matches!(reel.open_replay("nope").await, Err(ReelError::SessionNotFound(_))));
        assert!(matches!(reel.status("nope").await, Err(ReelError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_history_limit_is_capped() {
        let mut config = Config::default();
        config.history.max_limit = 2;
        let reel = Reel::new(
            Arc::new(EventLog::in_memory()),
            Arc::new(ScriptedProducer::new(vec![
                Step::Emit(AgentUnit::TextDelta("a".into())),
                Step::Emit(AgentUnit::TextDelta("b".into())),
            ])),
            Arc::new(StaticDirectory::new(["s1"])),
            &config,
        );
        reel.start("s1", "go").await.unwrap().interaction.wait().await;

        assert_eq!(reel.history("s1", 1, None).await.unwrap().len(), 2);
        assert_eq!(reel.history("s1", 1, Some(100)).await.unwrap().len(), 2);
        assert_eq!(reel.history("s1", 3, Some(1)).await.unwrap()[0].sequence, 3);
        assert!(reel.history("s1", 4, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_idle_session_is_noop() {
        let reel = reel(vec![]);
        assert_eq!(reel.cancel("s1").await.unwrap(), CancelOutcome::NotRunning);
        assert_eq!(reel.latest_sequence("s1").await.unwrap(), 0);
        assert!(reel.status("s1").await.unwrap().is_none());
    }

    #[test]
    fn test_open_log_backends() {
        let temp = tempdir().unwrap();
        let jsonl = StorageConfig {
            backend: StorageBackend::Jsonl,
            path: Some(temp.path().join("sessions")),
        };
        assert_eq!(open_log(&jsonl).unwrap().backend_name(), "jsonl");

        let sqlite = StorageConfig {
            backend: StorageBackend::Sqlite,
            path: Some(temp.path().join("events.db")),
        };
        assert_eq!(open_log(&sqlite).unwrap().backend_name(), "sqlite");

        let memory = StorageConfig {
            backend: StorageBackend::Memory,
            path: None,
        };
        assert_eq!(open_log(&memory).unwrap().backend_name(), "memory");
    }
}
