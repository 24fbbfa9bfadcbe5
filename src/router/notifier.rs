//! Synchronous in-process event fan-out.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::error;

/// Handle returned by [Notifier::subscribe], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Delivers events to every current subscriber at the time of the event.
///
/// Events are not queued, so subscribers miss whatever happened before they
/// subscribed. A panicking subscriber is logged and does not prevent
/// delivery to the others.
pub struct Notifier<T> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<T>)>>,
}

impl<T> Notifier<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(subscriber)));

        id
    }

    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);

        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to all subscribers, returning how many completed
    /// without panicking.
    pub fn notify(&self, event: &T) -> usize {
        // Subscribers may (un)subscribe from within their callback.
        let subscribers: Vec<Subscriber<T>> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();

        let mut delivered = 0;

        for subscriber in subscribers {
            match catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();

                    error!(context = "notifier", reason = %reason, "Subscriber panicked");
                }
            }
        }

        delivered
    }
}

impl<T> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Notifier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.len())
            .finish()
    }
}
