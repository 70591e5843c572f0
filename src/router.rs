//! Listener fan-out
//!
//! [`EventRouter`] holds the callbacks registered for one kind of event
//! (parsed messages, raw chunks, connection-state changes) and invokes each
//! of them in isolation: a panicking listener is logged and skipped, and the
//! remaining listeners still run.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

/// Shared listener callback
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`EventRouter::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Invoke `listeners` newest-first, isolating each call.
///
/// Returns the number of listeners that panicked.
pub fn dispatch<E: ?Sized>(topic: &str, listeners: &[Listener<E>], event: &E) -> usize {
    let mut failed = 0;
    for listener in listeners.iter().rev() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
            failed += 1;
            error!("Listener for '{}' panicked: {}", topic, panic_message(&*payload));
        }
    }
    failed
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Registration list plus dispatch for one event topic
pub struct EventRouter<E: ?Sized> {
    topic: &'static str,
    entries: Mutex<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E: ?Sized> EventRouter<E> {
    pub fn new(topic: &'static str) -> Self {
        Self {
            topic,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener: Listener<E> = Arc::new(listener);
        self.entries.lock().push((id, listener));
        id
    }

    /// Returns false if `id` was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Deliver `event` to every listener registered at the time of the call.
    ///
    /// The registration lock is released before any listener runs, so
    /// listeners may subscribe or unsubscribe (themselves included).
    pub fn dispatch(&self, event: &E) -> usize {
        let snapshot: Vec<Listener<E>> = {
            let entries = self.entries.lock();
            if entries.is_empty() {
                return 0;
            }
            entries.iter().map(|(_, l)| l.clone()).collect()
        };
        dispatch(self.topic, &snapshot, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_dispatch_newest_first() {
        let router = EventRouter::<u8>::new("test");
        let order = Arc::new(PlMutex::new(Vec::new()));

        for tag in 0..3 {
            let order = order.clone();
            router.subscribe(move |_| order.lock().push(tag));
        }

        router.dispatch(&0);
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let router = EventRouter::<u8>::new("test");
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        router.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        router.subscribe(|_| panic!("listener failure"));
        let c = calls.clone();
        router.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(router.dispatch(&7), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Router keeps working after a panic
        assert_eq!(router.dispatch(&8), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let router = Arc::new(EventRouter::<u8>::new("test"));
        let slot: Arc<PlMutex<Option<ListenerId>>> = Arc::new(PlMutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        router.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let r = router.clone();
        let s = slot.clone();
        let id = router.subscribe(move |_| {
            if let Some(id) = *s.lock() {
                r.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        router.dispatch(&1);
        assert_eq!(router.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        router.dispatch(&2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribe_during_dispatch_applies_next_time() {
        let router = Arc::new(EventRouter::<u8>::new("test"));
        let calls = Arc::new(AtomicUsize::new(0));

        let r = router.clone();
        let c = calls.clone();
        router.subscribe(move |_| {
            let c = c.clone();
            r.subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        });

        router.dispatch(&1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn test_unsized_events() {
        let router = EventRouter::<[u8]>::new("raw");
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let s = seen.clone();
        router.subscribe(move |bytes: &[u8]| s.lock().extend_from_slice(bytes));

        router.dispatch(&[0x90, 0x3C, 0x7F][..]);
        assert_eq!(*seen.lock(), vec![0x90, 0x3C, 0x7F]);
        assert!(!router.unsubscribe(ListenerId(99)));
    }
}
