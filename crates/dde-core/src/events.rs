//! Event payloads and subscriber bookkeeping.
//!
//! Subscribers are plain callbacks; delivery happens on whichever thread
//! observed the state change (usually the owning thread of the context).
//! During teardown paths a panicking subscriber is isolated so it cannot
//! prevent delivery to the remaining subscribers or leak facility resources.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dde_proto::{Bytes, DataFormat};
use parking_lot::Mutex;
use smol_str::SmolStr;

/// Application-defined state attached to an advise loop and echoed back with
/// every advise notification.
pub type AdviseState = Arc<dyn Any + Send + Sync>;

/// A conversation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedEvent {
    /// The partner terminated the conversation (as opposed to a local
    /// `disconnect` call).
    pub server_initiated: bool,
    /// The conversation ended because the object was disposed.
    pub disposed: bool,
}

/// Advise notification delivered to a client advise loop.
#[derive(Clone)]
pub struct AdviseEvent {
    pub item: SmolStr,
    pub format: DataFormat,
    pub state: Option<AdviseState>,
    /// Payload bytes; `None` for a warm loop.
    pub data: Option<Bytes>,
}

/// A service name was announced or withdrawn somewhere in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEvent {
    pub service: SmolStr,
}

/// Handle identifying one event subscription.
///
/// Returned by the `on_*` operations; pass it back to the owning object's
/// `unsubscribe` to detach the callback. Ids are unique across the process,
/// so a token handed to the wrong object is simply not found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

pub(crate) type Subscriber<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Subscriber list for one event kind.
pub(crate) struct EventHandlers<E> {
    subscribers: Mutex<Vec<(Subscription, Subscriber<E>)>>,
}

impl<E> EventHandlers<E> {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, subscriber: Subscriber<E>) -> Subscription {
        let subscription = Subscription(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((subscription, subscriber));
        subscription
    }

    /// Returns `false` when the subscription was not in this list.
    pub(crate) fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != subscription);
        subscribers.len() != before
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.subscribers.lock().is_empty()
    }

    /// Delivers to every subscriber; a panic propagates to the caller.
    pub(crate) fn emit(&self, event: &E) {
        let subscribers = self.subscribers.lock().clone();
        for (_, subscriber) in subscribers {
            subscriber(event);
        }
    }

    /// Delivers to every subscriber, isolating panics so teardown of the
    /// remaining subscribers is not blocked.
    pub(crate) fn emit_isolated(&self, event: &E) {
        let subscribers = self.subscribers.lock().clone();
        for (_, subscriber) in subscribers {
            if panic::catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                tracing::warn!("event subscriber panicked during teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn emit_reaches_all_subscribers() {
        let handlers = EventHandlers::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            handlers.subscribe(Arc::new(move |value: &u32| {
                count.fetch_add(*value as usize, Ordering::SeqCst);
            }));
        }

        handlers.emit(&2);
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn unsubscribed_handler_stops_receiving() {
        let handlers = EventHandlers::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_kept = Arc::clone(&count);
        let kept = handlers.subscribe(Arc::new(move |value: &u32| {
            count_kept.fetch_add(*value as usize, Ordering::SeqCst);
        }));
        let count_detached = Arc::clone(&count);
        let detached = handlers.subscribe(Arc::new(move |value: &u32| {
            count_detached.fetch_add(*value as usize, Ordering::SeqCst);
        }));

        assert!(handlers.unsubscribe(detached));
        assert!(!handlers.unsubscribe(detached));

        handlers.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(handlers.unsubscribe(kept));
        assert!(!handlers.has_subscribers());
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let handlers = EventHandlers::<()>::new();
        let reached = Arc::new(AtomicUsize::new(0));

        handlers.subscribe(Arc::new(|_: &()| panic!("boom")));
        let reached_clone = Arc::clone(&reached);
        handlers.subscribe(Arc::new(move |_: &()| {
            reached_clone.fetch_add(1, Ordering::SeqCst);
        }));

        handlers.emit_isolated(&());
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }
}
