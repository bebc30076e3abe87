//! Asynchronous event hook bus for domain events such as Fallback's
//! `activated`/`recovered`/`exhausted` or Retry's `attempt-start`/
//! `attempt-fail`/`exhausted`.
//!
//! # Why
//! Handlers must run asynchronously so a slow handler can never slow down
//! `Process`. Each
//! `emit` hands the event to every registered handler on its own spawned
//! task rather than invoking them inline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// A bus for one connector's domain event type `E`. Registered via the
/// connector's `on_*` methods, consumed by calling [`EventBus::emit`].
pub struct EventBus<E> {
    handlers: RwLock<Vec<Arc<dyn Fn(E) + Send + Sync>>>,
    closed: AtomicBool,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl<E: Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. No-op once the bus has been [`EventBus::close`]d.
    pub fn subscribe(&self, handler: impl Fn(E) + Send + Sync + 'static) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.handlers.write().unwrap().push(Arc::new(handler));
    }

    /// Dispatches `event` to every registered handler on its own task, so
    /// that a slow handler cannot delay the connector that emitted it. A
    /// clone is required per handler since each dispatch owns its event.
    pub fn emit(&self, event: E)
    where
        E: Clone,
    {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let handlers = self.handlers.read().unwrap().clone();
        for handler in handlers {
            let event = event.clone();
            if tokio::runtime::Handle::try_current().is_ok() {
                tokio::spawn(async move {
                    handler(event);
                });
            } else {
                // No runtime available (e.g. a synchronous test harness) —
                // fall back to inline dispatch rather than dropping the event.
                handler(event);
            }
        }
    }

    /// Idempotent shutdown: clears handlers and rejects future registrations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.handlers.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn handlers_receive_emitted_events() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.subscribe(move |v| {
            seen2.fetch_add(v as usize, Ordering::SeqCst);
        });
        bus.emit(5);
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drops_handlers() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.subscribe(move |v| {
            seen2.fetch_add(v as usize, Ordering::SeqCst);
        });
        bus.close();
        bus.close();
        bus.emit(5);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
