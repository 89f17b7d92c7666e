//! Per-subscriber bounded fan-out
//!
//! Each subscriber owns a bounded queue. Publishing appends to every queue
//! without waiting; a full queue sheds its oldest event and records the gap
//! as a single [`AssistantEvent::OverflowDropped`] marker at the head.
//! When a gap opens, the other subscribers are told through an
//! `ErrorOccurred` event of kind [`ErrorKind::SubscriberOverflow`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::{AssistantEvent, ErrorKind};

/// Opaque subscriber handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Handle plus delivery channel returned by [`EventBus::subscribe`]
#[derive(Debug)]
pub struct Subscription {
    /// Handle for [`EventBus::unsubscribe`]
    pub id: SubscriberId,
    /// Receiving end of the subscriber queue
    pub receiver: EventReceiver,
}

/// Broadcast bus for assistant events
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, Arc<Queue>>>,
}

#[derive(Debug, Default)]
struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<AssistantEvent>,
    closed: bool,
}

/// Outcome of appending to a subscriber queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pushed {
    Queued,
    /// The oldest event was shed and a new marker placed
    GapOpened,
    /// The oldest event was shed into an existing marker
    GapExtended,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Queue {
    /// Append an event, shedding the oldest on overflow
    fn push(&self, event: AssistantEvent, capacity: usize) -> Pushed {
        let mut state = lock(&self.state);
        if state.closed {
            return Pushed::Queued;
        }

        let marker_at_head = matches!(
            state.events.front(),
            Some(AssistantEvent::OverflowDropped { .. })
        );
        let pending = state.events.len() - usize::from(marker_at_head);

        let pushed = if pending < capacity {
            Pushed::Queued
        } else if marker_at_head {
            state.events.remove(1);
            if let Some(AssistantEvent::OverflowDropped { dropped }) = state.events.front_mut() {
                *dropped += 1;
            }
            Pushed::GapExtended
        } else {
            state.events.pop_front();
            state
                .events
                .push_front(AssistantEvent::OverflowDropped { dropped: 1 });
            Pushed::GapOpened
        };

        state.events.push_back(event);
        drop(state);
        self.notify.notify_one();
        pushed
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_one();
    }
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a new subscriber
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(Queue::default());
        lock(&self.inner.subscribers).insert(id, Arc::clone(&queue));
        tracing::debug!(subscriber = %id, "subscriber added");

        Subscription {
            id,
            receiver: EventReceiver { queue },
        }
    }

    /// Remove a subscriber; its receiver drains what is queued, then ends
    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Some(queue) = lock(&self.inner.subscribers).remove(&id) {
            queue.close();
            tracing::debug!(subscriber = %id, "subscriber removed");
        }
    }

    /// Deliver an event to every subscriber without blocking
    ///
    /// A subscriber that starts losing events is reported once per gap to
    /// every other subscriber.
    pub fn publish(&self, event: &AssistantEvent) {
        let capacity = self.inner.capacity;
        let mut subscribers = lock(&self.inner.subscribers);
        let mut gaps = Vec::new();
        subscribers.retain(|id, queue| {
            if lock(&queue.state).closed {
                tracing::debug!(subscriber = %id, "pruning closed subscriber");
                return false;
            }
            match queue.push(event.clone(), capacity) {
                Pushed::Queued => {}
                Pushed::GapOpened => {
                    tracing::warn!(
                        subscriber = %id,
                        event = event.name(),
                        "subscriber queue full, dropping oldest events"
                    );
                    gaps.push(*id);
                }
                Pushed::GapExtended => {
                    tracing::trace!(subscriber = %id, "subscriber still behind");
                }
            }
            true
        });

        for lagging in gaps {
            let report = AssistantEvent::error(
                ErrorKind::SubscriberOverflow,
                format!("{lagging} is falling behind"),
            );
            for (_, queue) in subscribers.iter().filter(|(id, _)| **id != lagging) {
                queue.push(report.clone(), capacity);
            }
        }
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }
}

/// Receiving end of a subscriber queue
#[derive(Debug)]
pub struct EventReceiver {
    queue: Arc<Queue>,
}

impl EventReceiver {
    /// Wait for the next event
    ///
    /// Returns `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<AssistantEvent> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut state = lock(&self.queue.state);
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the next event if one is queued
    #[must_use]
    pub fn try_recv(&mut self) -> Option<AssistantEvent> {
        lock(&self.queue.state).events.pop_front()
    }

    /// Number of queued events, including any overflow marker
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.queue.state).events.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        lock(&self.queue.state).closed = true;
    }
}
