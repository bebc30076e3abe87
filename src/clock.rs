//! Monotonic clock abstraction injected into [`crate::connectors::Backoff`],
//! [`crate::connectors::Timeout`], and [`crate::connectors::RateLimiter`].
//!
//! # Why
//! Hard-coding `tokio::time` into every connector that needs to sleep or read
//! the current instant makes those connectors untestable without real wall
//! clock delays. A small injectable trait lets tests swap in a [`TestClock`]
//! that advances synthetically, while production code uses [`SystemClock`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// A source of monotonic time and sleep scheduling.
///
/// # Contract
/// - `now` must be monotonically non-decreasing across calls.
/// - `sleep` must not complete before the requested duration has elapsed
///   according to this clock's own notion of time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current reading of this clock.
    fn now(&self) -> Instant;

    /// Returns a future that completes once `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests: time only moves forward when [`TestClock::advance`]
/// is called explicitly.
///
/// # Why
/// Backoff/Timeout/RateLimiter tests that depend on real sleeps are slow and
/// flaky under load. `TestClock` lets a test advance synthetic time and
/// release every pending sleep whose deadline has passed, without touching
/// the wall clock.
#[derive(Clone)]
pub struct TestClock {
    inner: Arc<Mutex<TestClockState>>,
    notify: Arc<Notify>,
    parked_changed: Arc<Notify>,
}

struct TestClockState {
    now: Instant,
    parked: usize,
}

impl std::fmt::Debug for TestClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestClock").finish()
    }
}

impl TestClock {
    /// Creates a test clock anchored at the real current instant.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestClockState {
                now: Instant::now(),
                parked: 0,
            })),
            notify: Arc::new(Notify::new()),
            parked_changed: Arc::new(Notify::new()),
        }
    }

    /// Moves synthetic time forward and wakes every pending `sleep`.
    pub fn advance(&self, by: Duration) {
        {
            let mut state = self.inner.lock().unwrap();
            state.now += by;
        }
        self.notify.notify_waiters();
    }

    /// Waits until there is at least one task parked in [`Clock::sleep`] on
    /// this clock. Useful to avoid racing `advance` against a task that
    /// hasn't reached its sleep point yet in deterministic tests.
    pub async fn block_until_ready(&self) {
        loop {
            let notified = self.parked_changed.notified();
            if self.inner.lock().unwrap().parked > 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.inner.lock().unwrap().now
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let deadline = self.now() + duration;
        let inner = self.inner.clone();
        let notify = self.notify.clone();
        let parked_changed = self.parked_changed.clone();
        Box::pin(async move {
            let mut parked = false;
            loop {
                {
                    let mut state = inner.lock().unwrap();
                    if state.now >= deadline {
                        if parked {
                            state.parked -= 1;
                        }
                        return;
                    }
                    if !parked {
                        state.parked += 1;
                        parked = true;
                    }
                }
                parked_changed.notify_waiters();
                notify.notified().await;
            }
        })
    }
}
