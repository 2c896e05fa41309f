//! The in-process event bus.
//!
//! Subscriptions are keyed by event kind. Subscriber lists are
//! copy-on-write: publishing clones an `Arc` snapshot of the list, so
//! publishers never block on subscription changes.
//!
//! Delivery modes:
//!
//! - [`DeliveryMode::Sync`] — the publishing thread runs the callback inline
//! - [`DeliveryMode::Queued`] — the event is pushed to a single worker task,
//!   preserving publication order per subscription
//!
//! Events published by one handler invocation reach each subscriber in
//! publication order; across handlers, order is only guaranteed within each
//! subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use parley_types::events::{Event, EventKind, EventSink};
use tokio::sync::mpsc;

/// How a subscriber receives events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Run the callback on the publishing thread.
    Sync,
    /// Dispatch to the bus worker task.
    Queued,
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: u64,
    mode: DeliveryMode,
    callback: Callback,
}

/// The event bus.
///
/// Cloning shares the underlying subscriber table and worker.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscribers: RwLock<HashMap<EventKind, Arc<Vec<Arc<Subscription>>>>>,
    queue: mpsc::UnboundedSender<(Callback, Event)>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus and spawn its queued-delivery worker.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<(Callback, Event)>();
        tokio::spawn(async move {
            while let Some((callback, event)) = rx.recv().await {
                callback(&event);
            }
        });

        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                queue,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to one event kind. Returns the subscription id.
    pub fn subscribe<F>(&self, kind: EventKind, mode: DeliveryMode, callback: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription {
            id,
            mode,
            callback: Arc::new(callback),
        });

        if let Ok(mut subscribers) = self.inner.subscribers.write() {
            let list = subscribers.entry(kind).or_default();
            let mut updated = list.as_ref().clone();
            updated.push(subscription);
            *list = Arc::new(updated);
        }
        id
    }

    /// Remove a subscription by id. Returns whether it existed.
    pub fn unsubscribe(&self, kind: EventKind, id: u64) -> bool {
        let Ok(mut subscribers) = self.inner.subscribers.write() else {
            return false;
        };
        let Some(list) = subscribers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        let updated: Vec<Arc<Subscription>> =
            list.iter().filter(|s| s.id != id).cloned().collect();
        let removed = updated.len() != before;
        *list = Arc::new(updated);
        removed
    }

    /// Number of subscriptions for a kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .read()
            .ok()
            .and_then(|subscribers| subscribers.get(&kind).map(|list| list.len()))
            .unwrap_or(0)
    }

    /// Publish an event to every subscriber of its kind.
    pub fn publish(&self, event: Event) {
        let snapshot = self
            .inner
            .subscribers
            .read()
            .ok()
            .and_then(|subscribers| subscribers.get(&event.kind()).cloned());
        let Some(list) = snapshot else {
            return;
        };

        for subscription in list.iter() {
            match subscription.mode {
                DeliveryMode::Sync => (subscription.callback)(&event),
                DeliveryMode::Queued => {
                    let _ = self
                        .inner
                        .queue
                        .send((Arc::clone(&subscription.callback), event.clone()));
                }
            }
        }
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: Event) {
        EventBus::publish(self, event);
    }
}
