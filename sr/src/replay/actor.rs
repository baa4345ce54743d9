//! Replay actor - one task per open replay
//!
//! The actor owns the cursor, state and rate of a single replay. Control calls
//! arrive as commands. Frames are pulled: the stream posts one request at a
//! time and the actor fills it only when an event is due, so the cursor never
//! runs ahead of what the consumer holds. Every wait (pacing, polling, demand)
//! also listens for commands, so control takes effect without waiting out the
//! current delay.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use eventlog::{Event, EventLog};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::LiveProbe;
use super::handle::ReplayHandle;
use super::messages::{FrameRequest, ReplayCommand, ReplayFrame, ReplayState, ReplayStatus};
use crate::config::ReplayConfig;
use crate::error::{ReelError, ReelResult};

/// Ceiling on any single computed wait, whatever the rate
const LONGEST_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Open replays by id
pub(crate) type Registry = Arc<Mutex<HashMap<String, ReplayHandle>>>;

/// Pacing and polling knobs
#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_gap: Duration,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self::from(&ReplayConfig::default())
    }
}

impl From<&ReplayConfig> for ReplaySettings {
    fn from(config: &ReplayConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            batch_size: config.batch_size.max(1),
            max_gap: Duration::from_millis(config.max_gap_ms),
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct ReplayActor {
    replay_id: String,
    session_id: String,
    log: Arc<EventLog>,
    live: Arc<dyn LiveProbe>,
    settings: ReplaySettings,
    commands: mpsc::Receiver<ReplayCommand>,
    demand: mpsc::Receiver<FrameRequest>,
    /// Outstanding request from the stream, if any
    want: Option<FrameRequest>,
    /// Final status for the stream once the actor stops
    last_words: Option<oneshot::Sender<ReplayStatus>>,
    registry: Registry,

    state: ReplayState,
    cursor: u64,
    rate: f64,
    /// Prefetched events starting at `cursor`
    pending: VecDeque<Event>,
    /// Timestamp of the last emitted event; `None` makes the next emission immediate
    previous: Option<DateTime<Utc>>,
    /// When the wait for the head of `pending` began
    wait_started: Option<Instant>,
}

impl ReplayActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        replay_id: String,
        session_id: String,
        log: Arc<EventLog>,
        live: Arc<dyn LiveProbe>,
        settings: ReplaySettings,
        commands: mpsc::Receiver<ReplayCommand>,
        demand: mpsc::Receiver<FrameRequest>,
        last_words: oneshot::Sender<ReplayStatus>,
        registry: Registry,
    ) -> Self {
        Self {
            replay_id,
            session_id,
            log,
            live,
            settings,
            commands,
            demand,
            want: None,
            last_words: Some(last_words),
            registry,
            state: ReplayState::Paused,
            cursor: 1,
            rate: 1.0,
            pending: VecDeque::new(),
            previous: None,
            wait_started: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(replay_id = %self.replay_id, session_id = %self.session_id, "Replay opened");
        loop {
            let flow = match self.state {
                ReplayState::Playing => self.play_step().await,
                ReplayState::Paused | ReplayState::Finished => self.idle().await,
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        self.unregister();
        self.state = ReplayState::Finished;
        if let Some(last_words) = self.last_words.take() {
            let _ = last_words.send(self.status());
        }
        info!(replay_id = %self.replay_id, cursor = self.cursor, "Replay closed");
    }

    fn unregister(&self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.replay_id);
    }

    fn status(&self) -> ReplayStatus {
        ReplayStatus {
            replay_id: self.replay_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state,
            cursor: self.cursor,
            rate: self.rate,
        }
    }

    /// Nothing to emit: wait for a command, a frame request, or the consumer to go away
    async fn idle(&mut self) -> Flow {
        tokio::select! {
            biased;
            cmd = self.commands.recv() => self.on_command(cmd).await,
            want = self.demand.recv() => self.on_demand(want),
        }
    }

    /// Like `idle`, but give up at `deadline`
    async fn idle_until(&mut self, deadline: Instant) -> Flow {
        tokio::select! {
            biased;
            cmd = self.commands.recv() => self.on_command(cmd).await,
            want = self.demand.recv() => self.on_demand(want),
            _ = tokio::time::sleep_until(deadline) => Flow::Continue,
        }
    }

    fn on_demand(&mut self, want: Option<FrameRequest>) -> Flow {
        match want {
            Some(want) => {
                self.want = Some(want);
                Flow::Continue
            }
            None => {
                debug!(replay_id = %self.replay_id, "ReplayActor: stream dropped");
                Flow::Stop
            }
        }
    }

    /// Hand `frame` to the waiting consumer; gives it back if nobody is waiting
    fn hand_over(&mut self, frame: ReplayFrame) -> Result<(), ReplayFrame> {
        match self.want.take() {
            Some(want) => want.send(frame),
            None => Err(frame),
        }
    }

    async fn on_command(&mut self, cmd: Option<ReplayCommand>) -> Flow {
        let Some(cmd) = cmd else {
            return Flow::Stop;
        };
        debug!(replay_id = %self.replay_id, ?cmd, "ReplayActor: command");

        match cmd {
            ReplayCommand::Play { reply } => {
                if self.state == ReplayState::Paused {
                    self.state = ReplayState::Playing;
                    self.restart_pacing();
                }
                let _ = reply.send(Ok(self.status()));
            }
            ReplayCommand::Pause { reply } => {
                if self.state == ReplayState::Playing {
                    self.state = ReplayState::Paused;
                    self.wait_started = None;
                }
                let _ = reply.send(Ok(self.status()));
            }
            ReplayCommand::Seek { target, reply } => {
                let result = self.seek(target).await;
                let _ = reply.send(result);
            }
            ReplayCommand::SetRate { rate, reply } => {
                let _ = reply.send(self.set_rate(rate));
            }
            ReplayCommand::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
            ReplayCommand::Close { reply } => {
                // Gone from the registry before the caller hears back
                self.unregister();
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn restart_pacing(&mut self) {
        self.previous = None;
        self.wait_started = None;
    }

    async fn seek(&mut self, target: i64) -> ReelResult<ReplayStatus> {
        if target < 1 {
            return Err(ReelError::SequenceOutOfRange(target));
        }
        if self.state == ReplayState::Finished {
            return Err(ReelError::ReplayFinished(self.replay_id.clone()));
        }
        let latest = self.log.latest_sequence(&self.session_id).await?;
        self.cursor = (target as u64).min(latest + 1);
        self.pending.clear();
        self.restart_pacing();
        debug!(replay_id = %self.replay_id, target, cursor = self.cursor, "ReplayActor: seek");
        Ok(self.status())
    }

    fn set_rate(&mut self, rate: f64) -> ReelResult<ReplayStatus> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ReelError::InvalidRate(rate));
        }
        if self.state == ReplayState::Finished {
            return Err(ReelError::ReplayFinished(self.replay_id.clone()));
        }
        self.rate = rate;
        Ok(self.status())
    }

    /// Recorded gap before `event`, clamped and scaled by the current rate
    fn gap_before(&self, event: &Event) -> Duration {
        let Some(previous) = self.previous else {
            return Duration::ZERO;
        };
        // Negative deltas (clock skew) pace as zero
        let recorded = (event.timestamp - previous).to_std().unwrap_or(Duration::ZERO);
        let scaled = recorded.min(self.settings.max_gap).as_secs_f64() / self.rate;
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(LONGEST_WAIT)
            .min(LONGEST_WAIT)
    }

    async fn play_step(&mut self) -> Flow {
        if self.pending.is_empty() {
            // Sample liveness before reading so a turn that ends in between
            // is caught by the read rather than missed
            let live = self.live.is_live(&self.session_id);
            match self
                .log
                .read(&self.session_id, self.cursor, self.settings.batch_size)
                .await
            {
                Ok(events) => self.pending.extend(events),
                Err(e) => {
                    warn!(replay_id = %self.replay_id, error = %e, "ReplayActor: log read failed, retrying");
                    return self.idle_until(Instant::now() + self.settings.poll_interval).await;
                }
            }
            if self.pending.is_empty() {
                if live {
                    return self.idle_until(Instant::now() + self.settings.poll_interval).await;
                }
                return self.finish().await;
            }
        }

        let gap = match self.pending.front() {
            Some(next) => self.gap_before(next),
            None => return Flow::Continue,
        };
        let deadline = *self.wait_started.get_or_insert_with(Instant::now) + gap;
        if Instant::now() < deadline {
            // Re-entered after the wait; a rate change in between moves the deadline
            return self.idle_until(deadline).await;
        }
        if self.want.is_none() {
            // Due, but the consumer has not asked yet
            return self.idle().await;
        }

        // The whole event goes out or none of it; a pause can only land between events
        let Some(event) = self.pending.pop_front() else {
            return Flow::Continue;
        };
        let (sequence, timestamp) = (event.sequence, event.timestamp);
        match self.hand_over(ReplayFrame::Event(event)) {
            Ok(()) => {
                self.cursor = sequence + 1;
                self.previous = Some(timestamp);
                self.wait_started = None;
            }
            Err(ReplayFrame::Event(event)) => self.pending.push_front(event),
            Err(ReplayFrame::Finished(_)) => {}
        }
        Flow::Continue
    }

    async fn finish(&mut self) -> Flow {
        self.state = ReplayState::Finished;
        self.wait_started = None;
        info!(replay_id = %self.replay_id, cursor = self.cursor, "Replay finished");

        let status = self.status();
        loop {
            if self.want.is_some() && self.hand_over(ReplayFrame::Finished(status.clone())).is_ok() {
                return Flow::Continue;
            }
            if let Flow::Stop = self.idle().await {
                return Flow::Stop;
            }
        }
    }
}
