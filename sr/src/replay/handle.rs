//! Control and output sides of an open replay

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::messages::{FrameRequest, ReplayCommand, ReplayFrame, ReplayStatus, StatusReply};
use crate::error::{ReelError, ReelResult};

/// Handle to send commands to a replay actor
#[derive(Debug, Clone)]
pub struct ReplayHandle {
    replay_id: String,
    session_id: String,
    tx: mpsc::Sender<ReplayCommand>,
}

impl ReplayHandle {
    pub(crate) fn new(replay_id: String, session_id: String, tx: mpsc::Sender<ReplayCommand>) -> Self {
        Self {
            replay_id,
            session_id,
            tx,
        }
    }

    pub fn replay_id(&self) -> &str {
        &self.replay_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn request(&self, make: impl FnOnce(StatusReply) -> ReplayCommand) -> ReelResult<ReplayStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| ReelError::ReplayNotFound(self.replay_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| ReelError::ReplayNotFound(self.replay_id.clone()))?
    }

    /// Start or resume emission; a no-op while already playing
    pub async fn play(&self) -> ReelResult<ReplayStatus> {
        debug!(replay_id = %self.replay_id, "play: called");
        self.request(|reply| ReplayCommand::Play { reply }).await
    }

    /// Stop at the next event boundary; a no-op while already paused
    pub async fn pause(&self) -> ReelResult<ReplayStatus> {
        debug!(replay_id = %self.replay_id, "pause: called");
        self.request(|reply| ReplayCommand::Pause { reply }).await
    }

    /// Move the cursor, clamped to `[1, latest_sequence + 1]`
    pub async fn seek(&self, target: i64) -> ReelResult<ReplayStatus> {
        debug!(replay_id = %self.replay_id, target, "seek: called");
        self.request(|reply| ReplayCommand::Seek { target, reply }).await
    }

    pub async fn set_rate(&self, rate: f64) -> ReelResult<ReplayStatus> {
        debug!(replay_id = %self.replay_id, rate, "set_rate: called");
        self.request(|reply| ReplayCommand::SetRate { rate, reply }).await
    }

    pub async fn status(&self) -> ReelResult<ReplayStatus> {
        self.request(|reply| ReplayCommand::Status { reply }).await
    }

    /// Release the replay; closing an already closed replay succeeds
    pub async fn close(&self) {
        debug!(replay_id = %self.replay_id, "close: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(ReplayCommand::Close { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// Output side of a replay: events, then one `Finished` frame
///
/// Frames are pulled one at a time, so whatever a pause or seek reports as the
/// cursor is exactly the next event this stream has not been handed. A replay
/// closed from elsewhere still ends with a `Finished` frame. Dropping the
/// stream ends the replay.
pub struct ReplayStream {
    replay_id: String,
    demand: mpsc::Sender<FrameRequest>,
    /// Request posted but not yet answered; kept across cancelled polls
    waiting: Option<oneshot::Receiver<ReplayFrame>>,
    last_words: Option<oneshot::Receiver<ReplayStatus>>,
    finished: bool,
}

impl ReplayStream {
    pub(crate) fn new(
        replay_id: String,
        demand: mpsc::Sender<FrameRequest>,
        last_words: oneshot::Receiver<ReplayStatus>,
    ) -> Self {
        Self {
            replay_id,
            demand,
            waiting: None,
            last_words: Some(last_words),
            finished: false,
        }
    }

    pub fn replay_id(&self) -> &str {
        &self.replay_id
    }

    /// Next frame, `None` once the replay is closed
    ///
    /// Cancel safe: a frame answered after the call was dropped is returned by
    /// the next call.
    pub async fn next_frame(&mut self) -> Option<ReplayFrame> {
        std::future::poll_fn(|cx| self.poll_frame(cx)).await
    }

    /// Next frame if the replay has already handed one over
    pub fn try_next_frame(&mut self) -> Option<ReplayFrame> {
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        match self.poll_frame(&mut cx) {
            Poll::Ready(frame) => frame,
            Poll::Pending => None,
        }
    }

    fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Option<ReplayFrame>> {
        if self.waiting.is_none() {
            let (tx, rx) = oneshot::channel();
            if self.demand.try_send(tx).is_err() {
                return self.poll_last_words(cx);
            }
            self.waiting = Some(rx);
        }
        let Some(rx) = self.waiting.as_mut() else {
            return Poll::Ready(None);
        };
        let answer = ready!(Pin::new(rx).poll(cx));
        self.waiting = None;
        match answer {
            Ok(frame) => {
                if matches!(frame, ReplayFrame::Finished(_)) {
                    self.finished = true;
                }
                Poll::Ready(Some(frame))
            }
            Err(_) => self.poll_last_words(cx),
        }
    }

    /// The actor is gone: surface its final status unless `Finished` was already seen
    fn poll_last_words(&mut self, cx: &mut Context<'_>) -> Poll<Option<ReplayFrame>> {
        let Some(rx) = self.last_words.as_mut() else {
            return Poll::Ready(None);
        };
        let status = ready!(Pin::new(rx).poll(cx));
        self.last_words = None;
        match status {
            Ok(status) if !self.finished => {
                self.finished = true;
                Poll::Ready(Some(ReplayFrame::Finished(status)))
            }
            _ => Poll::Ready(None),
        }
    }
}

impl Stream for ReplayStream {
    type Item = ReplayFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_frame(cx)
    }
}
