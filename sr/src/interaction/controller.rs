//! InteractionController - one running agent turn per session
//!
//! Each turn is driven by its own task. The driver is the only writer for the
//! turn: it appends every unit to the event log and then publishes it, so a
//! live subscriber never sees an event that failed to persist. Cancellation is
//! a token handed to the producer plus a bounded grace period, after which
//! the driver stops listening and finalizes on its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use eventlog::{Event, EventLog, Payload};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::producer::{AgentProducer, ProducerError, UnitStream};
use crate::broadcast::{Broadcaster, Subscription};
use crate::error::{ReelError, ReelResult};

/// Stop reason recorded when the producer's stream ends normally
const END_TURN: &str = "end_turn";

/// Lifecycle status of an interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl InteractionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Point-in-time view of an interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionSnapshot {
    pub id: String,
    pub session_id: String,
    pub status: InteractionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq)]
pub enum InteractionOutcome {
    Completed,
    Cancelled { forced: bool },
    /// `logged` is false when not even the `error` event could be written
    Failed { logged: bool, reason: String },
}

impl InteractionOutcome {
    pub fn status(&self) -> InteractionStatus {
        match self {
            Self::Completed => InteractionStatus::Completed,
            Self::Cancelled { .. } => InteractionStatus::Cancelled,
            Self::Failed { .. } => InteractionStatus::Failed,
        }
    }
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The running turn was cancelled; `forced` when the grace period ran out
    Cancelled { forced: bool },
    /// Nothing was running; no state changed
    NotRunning,
}

/// Handle to one interaction, cheap to clone
#[derive(Debug, Clone)]
pub struct Interaction {
    snapshot: watch::Receiver<InteractionSnapshot>,
    outcome: watch::Receiver<Option<InteractionOutcome>>,
}

impl Interaction {
    pub fn snapshot(&self) -> InteractionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn id(&self) -> String {
        self.snapshot.borrow().id.clone()
    }

    pub fn is_running(&self) -> bool {
        self.snapshot.borrow().status == InteractionStatus::Running
    }

    /// Wait for the turn to reach a terminal state
    pub async fn wait(&self) -> InteractionOutcome {
        let mut rx = self.outcome.clone();
        let outcome = rx.wait_for(|o| o.is_some()).await.ok().and_then(|o| o.clone());
        outcome.unwrap_or_else(|| InteractionOutcome::Failed {
            logged: false,
            reason: "interaction driver exited without an outcome".to_string(),
        })
    }
}

/// A freshly started interaction plus a live view of its events
///
/// The subscription is taken before the driver starts, so it sees every
/// event of the turn.
pub struct StartedInteraction {
    pub interaction: Interaction,
    pub events: Subscription,
}

struct Entry {
    interaction: Interaction,
    cancel: CancellationToken,
}

struct Inner {
    log: Arc<EventLog>,
    broadcaster: Broadcaster,
    producer: Arc<dyn AgentProducer>,
    cancel_grace: Duration,
    /// Current or most recent interaction per session
    sessions: Mutex<HashMap<String, Entry>>,
}

/// Owner of per-session interaction state
#[derive(Clone)]
pub struct InteractionController {
    inner: Arc<Inner>,
}

impl InteractionController {
    pub fn new(
        log: Arc<EventLog>,
        broadcaster: Broadcaster,
        producer: Arc<dyn AgentProducer>,
        cancel_grace: Duration,
    ) -> Self {
        debug!(producer = producer.name(), ?cancel_grace, "InteractionController::new: called");
        Self {
            inner: Arc::new(Inner {
                log,
                broadcaster,
                producer,
                cancel_grace,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a turn for `session_id`
    ///
    /// Fails with `InteractionInProgress` while another turn is running.
    pub fn start(&self, session_id: &str, message: &str) -> ReelResult<StartedInteraction> {
        debug!(%session_id, "InteractionController::start: called");
        let mut sessions = self.sessions();
        if let Some(entry) = sessions.get(session_id)
            && entry.interaction.is_running()
        {
            debug!(%session_id, "InteractionController::start: already running");
            return Err(ReelError::InteractionInProgress(session_id.to_string()));
        }

        let snapshot = InteractionSnapshot {
            id: Uuid::now_v7().to_string(),
            session_id: session_id.to_string(),
            status: InteractionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        };
        let id = snapshot.id.clone();
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let interaction = Interaction {
            snapshot: snapshot_rx,
            outcome: outcome_rx,
        };
        let cancel = CancellationToken::new();

        let events = self.inner.broadcaster.subscribe(session_id);
        let units = self.inner.producer.submit(session_id, message, cancel.clone());
        sessions.insert(
            session_id.to_string(),
            Entry {
                interaction: interaction.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(sessions);

        let driver = Driver {
            session_id: session_id.to_string(),
            log: Arc::clone(&self.inner.log),
            broadcaster: self.inner.broadcaster.clone(),
            cancel,
            cancel_grace: self.inner.cancel_grace,
            snapshot_tx,
            outcome_tx,
        };
        tokio::spawn(driver.run(units));

        info!(%session_id, interaction_id = %id, "Interaction started");
        Ok(StartedInteraction { interaction, events })
    }

    /// Cancel the running turn, waiting at most the grace period for the producer
    ///
    /// A no-op returning `NotRunning` when nothing is running.
    pub async fn cancel(&self, session_id: &str) -> CancelOutcome {
        debug!(%session_id, "InteractionController::cancel: called");
        let running = self
            .sessions()
            .get(session_id)
            .filter(|entry| entry.interaction.is_running())
            .map(|entry| (entry.interaction.clone(), entry.cancel.clone()));

        let Some((interaction, token)) = running else {
            debug!(%session_id, "InteractionController::cancel: nothing running");
            return CancelOutcome::NotRunning;
        };

        token.cancel();
        match interaction.wait().await {
            InteractionOutcome::Cancelled { forced } => CancelOutcome::Cancelled { forced },
            other => {
                debug!(%session_id, ?other, "InteractionController::cancel: turn ended before cancel took effect");
                CancelOutcome::NotRunning
            }
        }
    }

    /// Current or most recent interaction of a session
    pub fn status(&self, session_id: &str) -> Option<InteractionSnapshot> {
        self.sessions().get(session_id).map(|entry| entry.interaction.snapshot())
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.sessions()
            .get(session_id)
            .is_some_and(|entry| entry.interaction.is_running())
    }

    /// Cancel every running turn and wait for all of them to finalize
    pub async fn shutdown(&self) {
        debug!("InteractionController::shutdown: called");
        let running: Vec<Interaction> = self
            .sessions()
            .values()
            .filter(|entry| entry.interaction.is_running())
            .map(|entry| {
                entry.cancel.cancel();
                entry.interaction.clone()
            })
            .collect();

        info!(count = running.len(), "Cancelling running interactions");
        futures::future::join_all(running.iter().map(Interaction::wait)).await;
    }
}

/// Per-turn task state
struct Driver {
    session_id: String,
    log: Arc<EventLog>,
    broadcaster: Broadcaster,
    cancel: CancellationToken,
    cancel_grace: Duration,
    snapshot_tx: watch::Sender<InteractionSnapshot>,
    outcome_tx: watch::Sender<Option<InteractionOutcome>>,
}

impl Driver {
    async fn run(self, mut units: UnitStream) {
        let outcome = self.drive(&mut units).await;
        drop(units);

        let status = outcome.status();
        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.status = status;
            snapshot.finished_at = Some(Utc::now());
        });
        info!(session_id = %self.session_id, ?outcome, "Interaction finished");
        self.outcome_tx.send_replace(Some(outcome));
    }

    async fn drive(&self, units: &mut UnitStream) -> InteractionOutcome {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(units).await,
                next = units.next() => next,
            };

            match next {
                Some(Ok(unit)) => {
                    if self.cancel.is_cancelled() {
                        debug!(session_id = %self.session_id, "Driver: discarding unit produced after cancel");
                        return self.cancelled(units).await;
                    }
                    if let Err(e) = self.emit(unit.into_payload()).await {
                        return self.write_failed(e).await;
                    }
                }
                Some(Err(ProducerError::Cancelled)) => {
                    if self.cancel.is_cancelled() {
                        return self.cancelled(units).await;
                    }
                    warn!(session_id = %self.session_id, "Driver: producer cancelled on its own");
                    return self.finalize_cancel("cancelled by producer", false).await;
                }
                Some(Err(ProducerError::Failed(reason))) => {
                    warn!(session_id = %self.session_id, %reason, "Driver: producer failed");
                    return match self.emit(Payload::error(reason.clone())).await {
                        Ok(_) => InteractionOutcome::Failed { logged: true, reason },
                        Err(e) => {
                            error!(session_id = %self.session_id, error = %e, "Driver: could not log producer failure");
                            InteractionOutcome::Failed { logged: false, reason }
                        }
                    };
                }
                None => {
                    return match self.emit(Payload::completion(END_TURN)).await {
                        Ok(_) => InteractionOutcome::Completed,
                        Err(e) => self.write_failed(e).await,
                    };
                }
            }
        }
    }

    /// Wait up to the grace period for the producer to acknowledge, discarding
    /// anything it still yields, then write the `cancelled` event
    async fn cancelled(&self, units: &mut UnitStream) -> InteractionOutcome {
        debug!(session_id = %self.session_id, "Driver: cancellation requested");
        let drain = async {
            while let Some(item) = units.next().await {
                match item {
                    Ok(_) => debug!(session_id = %self.session_id, "Driver: discarding unit produced after cancel"),
                    Err(_) => break,
                }
            }
        };
        let forced = tokio::time::timeout(self.cancel_grace, drain).await.is_err();
        if forced {
            warn!(
                session_id = %self.session_id,
                grace_ms = self.cancel_grace.as_millis() as u64,
                "Driver: producer did not acknowledge cancel, forcing"
            );
        }
        self.finalize_cancel("cancelled by request", forced).await
    }

    async fn finalize_cancel(&self, reason: &str, forced: bool) -> InteractionOutcome {
        match self.emit(Payload::cancelled(reason, forced)).await {
            Ok(_) => InteractionOutcome::Cancelled { forced },
            Err(e) => self.write_failed(e).await,
        }
    }

    /// A durable write failed; try once to leave an `error` event behind
    async fn write_failed(&self, e: ReelError) -> InteractionOutcome {
        error!(session_id = %self.session_id, error = %e, "Driver: event log write failed, failing interaction");
        let reason = e.to_string();
        let logged = match self.emit(Payload::error(format!("event log write failed: {}", reason))).await {
            Ok(_) => true,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Driver: could not log the failure either");
                false
            }
        };
        InteractionOutcome::Failed { logged, reason }
    }

    /// Append, then publish
    async fn emit(&self, payload: Payload) -> ReelResult<Event> {
        let event = self.log.append(&self.session_id, payload).await?;
        let reached = self.broadcaster.publish(&event);
        debug!(
            session_id = %self.session_id,
            sequence = event.sequence,
            kind = %event.kind(),
            reached,
            "Driver: emitted"
        );
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::producer::{AgentUnit, ScriptedProducer, Step};
    use eventlog::EventKind;

    fn text(t: &str) -> Step {
        Step::Emit(AgentUnit::TextDelta(t.to_string()))
    }

    fn controller(steps: Vec<Step>, grace: Duration) -> (InteractionController, Arc<EventLog>) {
        let log = Arc::new(EventLog::in_memory());
        let controller = InteractionController::new(
            Arc::clone(&log),
            Broadcaster::new(64),
            Arc::new(ScriptedProducer::new(steps)),
            grace,
        );
        (controller, log)
    }

    async fn drain(sub: &mut Subscription) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = sub.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_start_streams_events_then_completion() {
        let (controller, log) = controller(vec![text("Hel"), text("lo")], Duration::from_secs(1));
        let mut started = controller.start("s1", "hi").unwrap();

        let events = drain(&mut started.events).await;
        let kinds: Vec<EventKind> = events.iter().map(Event::kind).collect();
        assert_eq!(kinds, vec![EventKind::TextDelta, EventKind::TextDelta, EventKind::Completion]);
        assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);

        assert_eq!(started.interaction.wait().await, InteractionOutcome::Completed);
        assert_eq!(log.read("s1", 1, 10).await.unwrap(), events);
        assert_eq!(controller.status("s1").unwrap().status, InteractionStatus::Completed);
        assert!(controller.status("s1").unwrap().finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_rejected_while_running() {
        let (controller, _log) = controller(vec![Step::Sleep(Duration::from_secs(60))], Duration::from_secs(1));
        let _first = controller.start("s1", "a").unwrap();
        assert!(matches!(
            controller.start("s1", "b"),
            Err(ReelError::InteractionInProgress(_))
        ));
        // Other sessions are unaffected
        assert!(controller.start("s2", "c").is_ok());
        controller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_exactly_one_wins() {
        let (controller, _log) = controller(vec![Step::Sleep(Duration::from_secs(5))], Duration::from_millis(100));
        let mut tasks = Vec::new();
        for i in 0..16 {
            let controller = controller.clone();
            tasks.push(tokio::spawn(async move {
                controller.start("s1", &format!("msg {}", i)).map(|s| s.interaction)
            }));
        }
        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, ReelError::InteractionInProgress(_))),
            }
        }
        assert_eq!(winners, 1);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_acknowledged_by_producer() {
        let (controller, log) = controller(
            vec![text("partial"), Step::Sleep(Duration::from_secs(60)), text("never")],
            Duration::from_secs(3),
        );
        let mut started = controller.start("s1", "hi").unwrap();
        assert_eq!(started.events.recv().await.unwrap().unwrap().sequence, 1);

        assert_eq!(controller.cancel("s1").await, CancelOutcome::Cancelled { forced: false });

        let events = log.read("s1", 1, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].payload, Payload::cancelled("cancelled by request", false));
        assert_eq!(started.events.recv().await.unwrap().unwrap().kind(), EventKind::Cancelled);
        assert_eq!(controller.status("s1").unwrap().status, InteractionStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_forced_after_grace() {
        let log = Arc::new(EventLog::in_memory());
        let producer = ScriptedProducer::new(vec![text("a"), Step::Sleep(Duration::from_secs(60)), text("late")])
            .ignoring_cancel();
        let controller = InteractionController::new(
            Arc::clone(&log),
            Broadcaster::new(64),
            Arc::new(producer),
            Duration::from_millis(100),
        );
        let mut started = controller.start("s1", "hi").unwrap();
        started.events.recv().await.unwrap();

        let began = tokio::time::Instant::now();
        assert_eq!(controller.cancel("s1").await, CancelOutcome::Cancelled { forced: true });
        assert!(began.elapsed() < Duration::from_secs(1));

        let kinds: Vec<EventKind> = log.read("s1", 1, 10).await.unwrap().iter().map(Event::kind).collect();
        assert_eq!(kinds, vec![EventKind::TextDelta, EventKind::Cancelled]);

        // The producer's late unit never lands in the log
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(log.latest_sequence("s1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let (controller, log) = controller(vec![], Duration::from_secs(1));
        assert_eq!(controller.cancel("s1").await, CancelOutcome::NotRunning);
        assert_eq!(log.latest_sequence("s1").await.unwrap(), 0);
        assert!(controller.status("s1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_twice_is_idempotent() {
        let (controller, log) = controller(vec![Step::Sleep(Duration::from_secs(60))], Duration::from_secs(1));
        let _started = controller.start("s1", "hi").unwrap();
        assert!(matches!(controller.cancel("s1").await, CancelOutcome::Cancelled { .. }));
        assert_eq!(controller.cancel("s1").await, CancelOutcome::NotRunning);
        assert_eq!(log.latest_sequence("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_producer_failure_appends_error() {
        let (controller, log) = controller(vec![text("x"), Step::Fail("model overloaded".into())], Duration::from_secs(1));
        let started = controller.start("s1", "hi").unwrap();
        assert_eq!(
            started.interaction.wait().await,
            InteractionOutcome::Failed {
                logged: true,
                reason: "model overloaded".into()
            }
        );
        assert_eq!(log.trailing_kind("s1").await.unwrap(), Some(EventKind::Error));
    }

    #[tokio::test]
    async fn test_session_returns_to_idle_after_turn() {
        let (controller, log) = controller(vec![text("x")], Duration::from_secs(1));
        let first = controller.start("s1", "one").unwrap();
        first.interaction.wait().await;
        let second = controller.start("s1", "two").unwrap();
        assert_ne!(first.interaction.id(), second.interaction.id());
        second.interaction.wait().await;
        let seqs: Vec<u64> = log.read("s1", 1, 10).await.unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let (controller, log) = controller(vec![Step::Sleep(Duration::from_secs(60))], Duration::from_secs(1));
        let a = controller.start("a", "x").unwrap();
        let b = controller.start("b", "x").unwrap();
        controller.shutdown().await;
        assert!(matches!(a.interaction.wait().await, InteractionOutcome::Cancelled { .. }));
        assert!(matches!(b.interaction.wait().await, InteractionOutcome::Cancelled { .. }));
        assert_eq!(log.trailing_kind("a").await.unwrap(), Some(EventKind::Cancelled));
        assert!(!controller.is_running("a"));
    }
}
