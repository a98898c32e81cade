//! Fan-out of server notifications to subscribers.
//!
//! Every subscriber owns a bounded queue drained by its own worker task.
//! [`EventBroadcaster::deliver`] only enqueues, so the dispatch loop never
//! waits on user code, and each subscriber sees events in wire order. When a
//! subscriber falls [`SUBSCRIBER_QUEUE`] events behind, further events for it
//! are dropped and logged at `WARN` until it catches up; other subscribers
//! are unaffected. A handler that panics is logged and the worker moves on to
//! the next event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::{Result, RpcError};

/// Events a subscriber may have queued before new ones are dropped for it.
pub const SUBSCRIBER_QUEUE: usize = 1024;

/// A server-pushed notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name, e.g. `tool.start`.
    pub method: String,
    /// Parameters (`Value::Null` when absent).
    pub params: Value,
}

/// Opaque subscription handle returned by [`EventBroadcaster::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callback invoked for each delivered notification.
pub type EventHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    filter: Option<String>,
    queue: mpsc::Sender<Arc<Notification>>,
    active: Arc<AtomicBool>,
}

impl Subscriber {
    fn wants(&self, event: &Notification) -> bool {
        self.filter.as_deref().is_none_or(|m| m == event.method)
    }
}

/// Ordered set of subscribers.
pub struct EventBroadcaster {
    client_id: String,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("client_id", &self.client_id)
            .field("subscribers", &self.len())
            .finish_non_exhaustive()
    }
}

impl EventBroadcaster {
    /// Broadcaster with no subscribers.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for every notification, or only for `method` when
    /// a filter is given.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NotRunning` when called outside a tokio runtime;
    /// the delivery worker needs one.
    pub fn subscribe(&self, filter: Option<String>, handler: EventHandler) -> Result<SubscriptionId> {
        let runtime = Handle::try_current().map_err(|_| {
            RpcError::NotRunning("subscribing requires a tokio runtime".into())
        })?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (queue, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let active = Arc::new(AtomicBool::new(true));

        runtime.spawn(run_subscriber(
            self.client_id.clone(),
            id,
            rx,
            Arc::clone(&active),
            handler,
        ));

        debug!(client_id = self.client_id, subscription = id.0, ?filter, "subscriber added");
        self.lock().push(Subscriber {
            id,
            filter,
            queue,
            active,
        });
        Ok(id)
    }

    /// Remove a subscription. Events not yet handled are skipped.
    ///
    /// Returns `false` if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subscribers = self.lock();
            subscribers
                .iter()
                .position(|s| s.id == id)
                .map(|index| subscribers.remove(index))
        };

        match removed {
            Some(subscriber) => {
                subscriber.active.store(false, Ordering::SeqCst);
                debug!(client_id = self.client_id, subscription = id.0, "subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Queue `event` for every matching subscriber, in subscription order.
    ///
    /// Returns the number of subscribers it was queued for. Never blocks; a
    /// subscriber whose queue is full misses this event.
    pub fn deliver(&self, event: Notification) -> usize {
        let event = Arc::new(event);
        let subscribers = self.lock();
        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|s| s.wants(&event)) {
            match subscriber.queue.try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        client_id = self.client_id,
                        subscription = subscriber.id.0,
                        method = event.method,
                        "subscriber queue full, notification dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Drop every subscription. Already-queued events are still handled.
    pub fn close(&self) {
        let drained: Vec<Subscriber> = self.lock().drain(..).collect();
        if !drained.is_empty() {
            debug!(client_id = self.client_id, count = drained.len(), "subscribers released");
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_subscriber(
    client_id: String,
    id: SubscriptionId,
    mut rx: mpsc::Receiver<Arc<Notification>>,
    active: Arc<AtomicBool>,
    handler: EventHandler,
) {
    while let Some(event) = rx.recv().await {
        if !active.load(Ordering::SeqCst) {
            break;
        }
        if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
            warn!(
                client_id,
                subscription = id.0,
                method = event.method,
                "event handler panicked"
            );
        }
    }
}
