//! Synchronous, ordered, multi-subscriber event dispatch.
//!
//! The teacher's own event bus (`cuenv-events`) forwards emissions
//! through a `tokio::sync::broadcast` channel from a background task.
//! That is eventually-consistent and lossy under subscriber lag, which
//! violates the ordering contract this bus must honor: emission is
//! synchronous and dispatch order matches the real-time order events
//! were emitted in. So subscribers here are plain closures called
//! in-line, in registration order, on the emitting thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use crate::event::{Emission, ShadowdogEvent};

type Subscriber = Box<dyn Fn(&Emission) + Send + Sync>;

/// Typed in-process pub/sub bus. Cheap to clone (wraps an `Arc`-free
/// `Mutex<Vec<_>>` directly; the bus itself is held behind an `Arc` by
/// callers that need to share it across components).
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber. Subscribers are invoked in registration
    /// order for every subsequent `emit` call.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&Emission) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .expect("event bus subscriber lock poisoned")
            .push(Box::new(handler));
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus subscriber lock poisoned")
            .len()
    }

    /// Dispatch synchronously to every subscriber in registration
    /// order. A panicking subscriber is caught and logged; it cannot
    /// poison emission for the rest (spec.md §4.8: "subscribers may
    /// not throw across the boundary").
    pub fn emit(&self, event: ShadowdogEvent) {
        let emission = Emission {
            id: Uuid::new_v4(),
            emitted_at: Utc::now(),
            event,
        };
        let subscribers = self
            .subscribers
            .lock()
            .expect("event bus subscriber lock poisoned");
        for subscriber in subscribers.iter() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| subscriber(&emission))) {
                tracing::error!(marker = emission.event.marker(), ?panic, "event subscriber panicked");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatches_to_all_subscribers_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = Arc::clone(&order);
        bus.subscribe(move |_| order_a.lock().unwrap().push("a"));
        let order_b = Arc::clone(&order);
        bus.subscribe(move |_| order_b.lock().unwrap().push("b"));

        bus.emit(ShadowdogEvent::Initialized);

        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn emission_is_synchronous() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(ShadowdogEvent::GenerateStarted);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        bus.subscribe(|_| panic!("boom"));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(ShadowdogEvent::Pause);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn carries_typed_payload() {
        let bus = EventBus::new();
        let captured: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let captured_clone = Arc::clone(&captured);
        bus.subscribe(move |emission| {
            if let ShadowdogEvent::Changed { path, .. } = &emission.event {
                *captured_clone.lock().unwrap() = Some(path.clone());
            }
        });

        bus.emit(ShadowdogEvent::Changed {
            path: "src/app.txt".to_string(),
            kind: ChangeKind::Modify,
        });

        assert_eq!(captured.lock().unwrap().as_deref(), Some("src/app.txt"));
    }

    #[test]
    fn subscriber_count_reflects_registrations() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.subscribe(|_| {});
        bus.subscribe(|_| {});
        assert_eq!(bus.subscriber_count(), 2);
    }
}
