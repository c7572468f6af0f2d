//! Event Bus
//!
//! In-process publish/subscribe with a bounded history.
//!
//! - Publishing never blocks: each subscriber has a bounded queue and
//!   events that do not fit are dropped for that subscriber only.
//! - Delivery to a subscriber is in sequence order.
//! - The first drop for a subscriber emits a `bus.overflow` diagnostic to
//!   history and to the other subscribers.
//! - A subscriber that fails or goes away never affects the publisher.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::Utc;
use futures::Stream;
use log::{debug, warn};
use serde_json::json;
use tokio::sync::mpsc;

use super::event::{Event, EventFilter, EventKind};

/// Default number of events kept for replay and `history()`.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Default per-subscriber queue length.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Process-wide so sequences stay unique across buses.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

struct Subscriber {
    tx: mpsc::Sender<Event>,
    filter: EventFilter,
    dropped: u64,
    overflowing: bool,
}

struct BusInner {
    history: VecDeque<Event>,
    subscribers: HashMap<u64, Subscriber>,
    next_id: u64,
}

/// Event bus shared by the engine, orchestrator and observers.
pub struct EventBus {
    inner: Mutex<BusInner>,
    history_capacity: usize,
    subscriber_buffer: usize,
}

impl EventBus {
    /// Creates a bus keeping `history_capacity` events, with
    /// `subscriber_buffer` slots per subscriber.
    pub fn new(history_capacity: usize, subscriber_buffer: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                history: VecDeque::with_capacity(history_capacity.min(DEFAULT_HISTORY_CAPACITY)),
                subscribers: HashMap::new(),
                next_id: 1,
            }),
            history_capacity,
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes an event and returns its assigned sequence number.
    pub fn publish(&self, mut event: Event) -> u64 {
        let mut inner = self.lock();
        stamp(&mut event);
        let sequence = event.sequence;
        debug!(
            "event #{} {} session={} step={}",
            sequence,
            event.kind,
            event.session_id.as_deref().unwrap_or("-"),
            event.step_id.as_deref().unwrap_or("-")
        );

        let overflowed = self.deliver(&mut inner, &event, None);
        self.record(&mut inner, event);

        for (subscriber, dropped) in overflowed {
            warn!(
                "Subscriber {} is not keeping up; dropping events ({} so far)",
                subscriber, dropped
            );
            let mut diagnostic = Event::diagnostic(
                EventKind::BusOverflow,
                json!({ "subscriber": subscriber, "dropped": dropped }),
            );
            stamp(&mut diagnostic);
            // Diagnostics are best effort and never cascade.
            self.deliver(&mut inner, &diagnostic, Some(subscriber));
            self.record(&mut inner, diagnostic);
        }

        sequence
    }

    /// Sends `event` to every matching subscriber except `skip`. Returns
    /// subscribers that just started overflowing, unless delivering a
    /// diagnostic.
    fn deliver(&self, inner: &mut BusInner, event: &Event, skip: Option<u64>) -> Vec<(u64, u64)> {
        let is_diagnostic = skip.is_some();
        let mut overflowed = Vec::new();
        let mut closed = Vec::new();

        for (&id, sub) in inner.subscribers.iter_mut() {
            if Some(id) == skip || !sub.filter.matches(event) {
                continue;
            }

            match sub.tx.try_send(event.clone()) {
                Ok(()) => sub.overflowing = false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped += 1;
                    if !sub.overflowing && !is_diagnostic {
                        overflowed.push((id, sub.dropped));
                    }
                    sub.overflowing = true;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in closed {
            debug!("Subscriber {} went away, removing", id);
            inner.subscribers.remove(&id);
        }

        overflowed
    }

    fn record(&self, inner: &mut BusInner, event: Event) {
        if self.history_capacity == 0 {
            return;
        }
        while inner.history.len() >= self.history_capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(event);
    }

    /// Subscribes to future events. `None` receives everything.
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        let mut inner = self.lock();
        self.register(&mut inner, filter.unwrap_or_default(), VecDeque::new())
    }

    /// Subscribes and first replays matching events still in history.
    ///
    /// Replay and live delivery are set up atomically with respect to
    /// publishing, so no event is missed or seen twice.
    pub fn subscribe_with_replay(&self, filter: Option<EventFilter>) -> Subscription {
        let filter = filter.unwrap_or_default();
        let mut inner = self.lock();
        let backlog: VecDeque<Event> = inner
            .history
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        self.register(&mut inner, filter, backlog)
    }

    fn register(&self, inner: &mut BusInner, filter: EventFilter, backlog: VecDeque<Event>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                tx,
                filter,
                dropped: 0,
                overflowing: false,
            },
        );
        debug!("Subscriber {} registered ({} replayed)", id, backlog.len());

        Subscription { id, backlog, rx }
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, subscription_id: u64) -> bool {
        self.lock().subscribers.remove(&subscription_id).is_some()
    }

    /// Matching events from history, oldest first.
    pub fn history(&self, filter: Option<&EventFilter>) -> Vec<Event> {
        self.lock()
            .history
            .iter()
            .filter(|e| filter.map_or(true, |f| f.matches(e)))
            .cloned()
            .collect()
    }

    /// Number of events dropped for a subscriber so far.
    pub fn dropped(&self, subscription_id: u64) -> Option<u64> {
        self.lock().subscribers.get(&subscription_id).map(|s| s.dropped)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_SUBSCRIBER_BUFFER)
    }
}

fn stamp(event: &mut Event) {
    event.sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    event.timestamp = Utc::now();
}

/// Receiving end of a subscription.
///
/// Yields replayed events first, then live ones. Dropping it detaches the
/// subscriber on the next publish.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    backlog: VecDeque<Event>,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event. Returns `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    /// Returns the next already-delivered event, if any.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.backlog.pop_front().or_else(|| self.rx.try_recv().ok())
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        if let Some(event) = self.backlog.pop_front() {
            return Poll::Ready(Some(event));
        }
        self.rx.poll_recv(cx)
    }
}
