//! Live Broadcaster - per-session fan-out of freshly appended events
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a subscriber
//! whose queue is full is dropped and told so through [`ReelError::SubscriberOverflow`]
//! once it has drained what was already queued. The producer is never slowed
//! by a viewer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use eventlog::Event;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::error::{ReelError, ReelResult};

/// Default per-subscriber queue capacity (events)
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct Slot {
    id: u64,
    tx: mpsc::Sender<Event>,
    overflowed: Arc<AtomicBool>,
}

struct Inner {
    capacity: usize,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<String, Vec<Slot>>>,
}

impl Inner {
    fn remove(&self, session_id: &str, id: u64) -> bool {
        let Ok(mut sessions) = self.sessions.lock() else {
            return false;
        };
        let Some(slots) = sessions.get_mut(session_id) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        let removed = slots.len() != before;
        if slots.is_empty() {
            sessions.remove(session_id);
        }
        removed
    }
}

/// Fan-out hub for live events, cheap to clone
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// Create a broadcaster whose subscribers each buffer `queue_capacity` events
    pub fn new(queue_capacity: usize) -> Self {
        debug!(queue_capacity, "Broadcaster::new: called");
        Self {
            inner: Arc::new(Inner {
                capacity: queue_capacity.max(1),
                next_id: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Receive events published for `session_id` from now on
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(%session_id, subscriber = id, "Broadcaster::subscribe: called");
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));

        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.entry(session_id.to_string()).or_default().push(Slot {
                id,
                tx,
                overflowed: Arc::clone(&overflowed),
            });
        }

        Subscription {
            id,
            session_id: session_id.to_string(),
            rx,
            overflowed,
            overflow_reported: false,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every current subscriber of its session
    ///
    /// Never blocks. Returns how many subscribers accepted the event.
    pub fn publish(&self, event: &Event) -> usize {
        debug!(session_id = %event.session_id, sequence = event.sequence, "Broadcaster::publish: called");
        let Ok(mut sessions) = self.inner.sessions.lock() else {
            return 0;
        };
        let Some(slots) = sessions.get_mut(&event.session_id) else {
            return 0;
        };

        let mut delivered = 0;
        slots.retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    session_id = %event.session_id,
                    subscriber = slot.id,
                    sequence = event.sequence,
                    "Broadcaster: subscriber queue full, dropping subscriber"
                );
                slot.overflowed.store(true, Ordering::Release);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = slot.id, "Broadcaster: subscriber gone, removing");
                false
            }
        });
        if slots.is_empty() {
            sessions.remove(&event.session_id);
        }
        delivered
    }

    /// Number of live subscribers for a session
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .sessions
            .lock()
            .map(|sessions| sessions.get(session_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// One live subscriber's view of a session
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    id: u64,
    session_id: String,
    rx: mpsc::Receiver<Event>,
    overflowed: Arc<AtomicBool>,
    overflow_reported: bool,
    hub: Weak<Inner>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event in publish order
    ///
    /// `Ok(None)` once unsubscribed (or the broadcaster is gone). An
    /// overflowed subscriber first receives everything that was queued, then
    /// a single `Err(SubscriberOverflow)`, then `Ok(None)`.
    pub async fn recv(&mut self) -> ReelResult<Option<Event>> {
        match self.rx.recv().await {
            Some(event) => Ok(Some(event)),
            None => self.closed(),
        }
    }

    /// Non-waiting variant of [`Subscription::recv`]; `Ok(None)` when nothing is queued
    pub fn try_recv(&mut self) -> ReelResult<Option<Event>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => self.closed(),
        }
    }

    fn closed(&mut self) -> ReelResult<Option<Event>> {
        if self.overflowed.load(Ordering::Acquire) && !self.overflow_reported {
            self.overflow_reported = true;
            return Err(ReelError::SubscriberOverflow);
        }
        Ok(None)
    }

    /// Stop receiving new events; idempotent
    ///
    /// Events already queued can still be drained with `recv`.
    pub fn unsubscribe(&mut self) {
        if let Some(hub) = self.hub.upgrade()
            && hub.remove(&self.session_id, self.id)
        {
            debug!(session_id = %self.session_id, subscriber = self.id, "Subscription::unsubscribe: removed");
        }
        self.rx.close();
    }

    /// Lazy stream form; ends after the overflow notice or on unsubscribe
    pub fn into_stream(self) -> BoxStream<'static, ReelResult<Event>> {
        stream::unfold(self, |mut sub| async move {
            match sub.recv().await {
                Ok(Some(event)) => Some((Ok(event), sub)),
                Ok(None) => None,
                Err(e) => Some((Err(e), sub)),
            }
        })
        .boxed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
