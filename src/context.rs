//! Cancellation, deadline, and value propagation for a single pipeline
//! invocation — the caller-provided cancellation context threaded through
//! every connector call.
//!
//! # Why
//! The engine does not invent a separate cancellation channel:
//! every suspension point in every connector selects on this context's
//! cancellation signal. Deriving a child context for Timeout/Race/Contest/
//! Concurrent must introduce a new cancel scope while preserving the
//! parent's values (trace ids and the like) — mirrored here on
//! [`Context::with_value`] walking the parent chain on lookup.
//!
//! A `Context` carries its own [`Clock`] (defaulting to [`SystemClock`]) so
//! that a deadline it derives is always evaluated against the same notion of
//! time that created it — important once a [`crate::clock::TestClock`] is
//! swapped in for deterministic tests.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::clock::{Clock, SystemClock};

/// Why a [`Context`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// An ancestor or this context's own cancel handle was invoked.
    Canceled,
    /// This context's deadline elapsed.
    DeadlineExceeded,
}

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelState {
    fn cancel(&self) -> bool {
        let first = self
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

struct ValueEntry {
    key: &'static str,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<ValueEntry>>,
}

/// A single pipeline invocation's cancellation and value scope, modeled on
/// Go's `context.Context`.
///
/// Cloning a `Context` shares the same cancellation state; deriving one with
/// [`Context::with_cancel`] or [`Context::with_timeout`] introduces a fresh,
/// independently-cancelable child scope whose `is_done`/`done` also fire when
/// any ancestor is canceled.
#[derive(Clone)]
pub struct Context {
    state: Arc<CancelState>,
    parent: Option<Box<Context>>,
    deadline: Option<Instant>,
    values: Option<Arc<ValueEntry>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("canceled", &self.is_canceled_here())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// A handle to cancel the [`Context`] it was derived alongside. Cancelling
/// twice is a no-op after the first call.
#[derive(Clone)]
pub struct CancelFn(Arc<CancelState>);

impl CancelFn {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

impl Context {
    /// The root context: never canceled, never done, no values, backed by
    /// [`SystemClock`].
    pub fn background() -> Self {
        Self {
            state: Arc::new(CancelState::default()),
            parent: None,
            deadline: None,
            values: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Returns a copy of this context backed by `clock` instead. Used in
    /// tests to swap in a [`crate::clock::TestClock`] so deadlines created
    /// downstream (e.g. by `Timeout`) advance synthetically.
    pub fn with_clock(&self, clock: Arc<dyn Clock>) -> Context {
        let mut child = self.clone();
        child.clock = clock;
        child
    }

    /// The clock this context (and anything it derives) evaluates time with.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Derives a child context with an independent cancel scope. Canceling
    /// the parent (or any ancestor) still propagates to the child.
    pub fn with_cancel(&self) -> (Context, CancelFn) {
        let state = Arc::new(CancelState::default());
        let child = Context {
            state: state.clone(),
            parent: Some(Box::new(self.clone())),
            deadline: self.deadline,
            values: self.values.clone(),
            clock: self.clock.clone(),
        };
        (child, CancelFn(state))
    }

    /// Derives a child context with a hard deadline `duration` from now,
    /// measured via this context's own clock. The returned [`CancelFn`]
    /// should be invoked once the guarded operation completes, to release
    /// the cancel scope promptly (the connector-side equivalent of Go's
    /// `defer cancel()`).
    pub fn with_timeout(&self, duration: Duration) -> (Context, CancelFn) {
        let (mut child, cancel) = self.with_cancel();
        let new_deadline = child.clock.now() + duration;
        child.deadline = Some(match child.deadline {
            Some(existing) if existing < new_deadline => existing,
            _ => new_deadline,
        });
        (child, cancel)
    }

    /// Attaches a value visible to this context and all of its descendants.
    /// Looking up a key that a closer scope also set returns the closer
    /// value (shadowing), matching Go's `context.WithValue` semantics.
    pub fn with_value<V: Send + Sync + 'static>(&self, key: &'static str, value: V) -> Context {
        let mut child = self.clone();
        child.values = Some(Arc::new(ValueEntry {
            key,
            value: Arc::new(value),
            parent: self.values.clone(),
        }));
        child
    }

    /// Looks up a value by key, walking up the value chain.
    pub fn value(&self, key: &'static str) -> Option<Arc<dyn Any + Send + Sync>> {
        let mut cur = self.values.as_ref();
        while let Some(entry) = cur {
            if entry.key == key {
                return Some(entry.value.clone());
            }
            cur = entry.parent.as_ref();
        }
        None
    }

    fn is_canceled_here(&self) -> bool {
        self.state.is_canceled()
    }

    /// True if this context or any ancestor has been canceled, or if this
    /// context's deadline (if any) has already passed.
    pub fn is_done(&self) -> bool {
        if self.is_canceled_here() {
            return true;
        }
        if let Some(deadline) = self.deadline {
            if self.clock.now() >= deadline {
                return true;
            }
        }
        match &self.parent {
            Some(parent) => parent.is_done(),
            None => false,
        }
    }

    /// Classifies why `is_done` returned true. Deadline expiry takes
    /// precedence over an explicit cancel when both conditions hold, since a
    /// connector's own timeout is considered the more specific cause.
    pub fn err(&self) -> Option<DoneReason> {
        if let Some(deadline) = self.deadline {
            if self.clock.now() >= deadline {
                return Some(DoneReason::DeadlineExceeded);
            }
        }
        if self.is_canceled_here() {
            return Some(DoneReason::Canceled);
        }
        self.parent.as_ref().and_then(|p| p.err())
    }

    /// Waits until this context (or an ancestor) is canceled. Ignores any
    /// deadline — use [`Context::done`] to also race a deadline timer.
    pub async fn canceled(&self) {
        loop {
            if self.is_canceled_here() {
                return;
            }
            let notified = self.state.notify.notified();
            if self.is_canceled_here() {
                return;
            }
            match &self.parent {
                Some(parent) => {
                    let parent_fut = Box::pin(parent.canceled());
                    tokio::select! {
                        _ = notified => {}
                        _ = parent_fut => { return; }
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Waits until this context is done: canceled (directly or via an
    /// ancestor) or its deadline has elapsed, whichever comes first. Since
    /// `with_cancel`/`with_timeout` always propagate the nearest ancestor
    /// deadline down onto `self.deadline`, racing just this context's own
    /// deadline timer against [`Context::canceled`] is sufficient — no need
    /// to separately walk ancestors for their deadlines.
    pub async fn done(&self) {
        let deadline_wait = async {
            match self.deadline {
                Some(deadline) => {
                    let now = self.clock.now();
                    if now < deadline {
                        self.clock.sleep(deadline - now).await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = self.canceled() => {}
            _ = deadline_wait => {}
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_never_done() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert_eq!(ctx.err(), None);
    }

    #[test]
    fn cancel_is_observable_on_child() {
        let root = Context::background();
        let (child, cancel) = root.with_cancel();
        assert!(!child.is_done());
        cancel.cancel();
        assert!(child.is_done());
        assert_eq!(child.err(), Some(DoneReason::Canceled));
    }

    #[test]
    fn parent_cancel_propagates_to_child() {
        let (parent, parent_cancel) = Context::background().with_cancel();
        let (child, _cancel) = parent.with_cancel();
        assert!(!child.is_done());
        parent_cancel.cancel();
        assert!(child.is_done());
    }

    #[test]
    fn values_are_inherited_and_shadowed() {
        let root = Context::background().with_value("trace-id", 7u64);
        let child = root.with_value("trace-id", 9u64);
        assert_eq!(
            *root.value("trace-id").unwrap().downcast_ref::<u64>().unwrap(),
            7
        );
        assert_eq!(
            *child.value("trace-id").unwrap().downcast_ref::<u64>().unwrap(),
            9
        );
    }

    #[tokio::test]
    async fn timeout_marks_deadline_exceeded() {
        use crate::clock::TestClock;
        let clock = Arc::new(TestClock::new());
        let base = Context::background().with_clock(clock.clone());
        let (child, _cancel) = base.with_timeout(Duration::from_millis(10));
        assert!(!child.is_done());
        clock.advance(Duration::from_millis(11));
        assert!(child.is_done());
        assert_eq!(child.err(), Some(DoneReason::DeadlineExceeded));
    }
}
