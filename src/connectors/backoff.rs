//! Retry with exponential inter-attempt delay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use crate::clock::{Clock, SystemClock};
use crate::context::Context;
use crate::error::{CloseErrors, Failure};
use crate::observability::{EventBus, MetricsProvider, Tracer};
use crate::processor::Processor;

use super::util::{context_done_failure, default_metrics};

pub use super::retry::RetryEvent as BackoffEvent;

/// Identical to [`super::retry::Retry`] except that between failed attempts
/// it waits `base_delay * 2^(attempt - 1)`, doubling after each failure, via
/// an injectable [`Clock`]. No wait happens after the last attempt; a
/// cancellation during the wait ends it immediately.
pub struct Backoff<T: Send + Sync + 'static> {
    name: String,
    child: Arc<dyn Processor<T>>,
    max_attempts: usize,
    base_delay: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsProvider>,
    tracer: Tracer,
    events: EventBus<BackoffEvent>,
}

impl<T: Send + Sync + 'static> Backoff<T> {
    pub fn new(
        name: impl Into<String>,
        child: Arc<dyn Processor<T>>,
        max_attempts: i64,
        base_delay: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            child,
            max_attempts: max_attempts.max(1) as usize,
            base_delay,
            clock: Arc::new(SystemClock),
            metrics: default_metrics(),
            tracer: Tracer::new("backoff"),
            events: EventBus::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn on_event(&self, handler: impl Fn(BackoffEvent) + Send + Sync + 'static) {
        self.events.subscribe(handler);
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        // Capped well below the shift width of `Duration`'s internal
        // representation so a large `attempt` count can never overflow.
        let exponent = (attempt - 1).min(20) as u32;
        self.base_delay * 2u32.pow(exponent)
    }
}

#[async_trait]
impl<T: Send + Sync + Clone + 'static> Processor<T> for Backoff<T> {
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        for attempt in 1..=self.max_attempts {
            self.events.emit(BackoffEvent::AttemptStart { attempt });
            let span = self.tracer.start_attempt(self.child.name(), attempt);
            match self.child.process(ctx, value.clone()).instrument(span.clone()).await {
                Ok(result) => {
                    self.tracer.record_outcome(&span, "success", None);
                    return Ok(result);
                }
                Err(failure) => {
                    self.tracer
                        .record_outcome(&span, "failure", Some(&failure.to_string()));
                    self.events.emit(BackoffEvent::AttemptFail {
                        attempt,
                        error: failure.to_string(),
                    });
                    self.metrics.counter("backoff.attempt_failed.total").increment();

                    if attempt == self.max_attempts {
                        self.metrics.counter("backoff.exhausted.total").increment();
                        self.events.emit(BackoffEvent::Exhausted {
                            attempts: self.max_attempts,
                        });
                        let mut failure = failure;
                        failure.input_data = value;
                        failure.push_front_path(self.name.clone());
                        return Err(failure);
                    }

                    if ctx.is_done() {
                        return Err(context_done_failure(&self.name, value, ctx));
                    }

                    let delay = self.delay_for(attempt);
                    tokio::select! {
                        _ = self.clock.sleep(delay) => {}
                        _ = ctx.done() => {
                            return Err(context_done_failure(&self.name, value, ctx));
                        }
                    }
                }
            }
        }

        unreachable!("max_attempts is always >= 1, loop always returns")
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) -> Result<(), CloseErrors> {
        self.events.close();
        self.child.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::error::CodedError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    struct CountingFail {
        name: String,
        succeed_on: usize,
        calls: StdArc<AtomicUsize>,
    }

    #[async_trait]
    impl Processor<i32> for CountingFail {
        async fn process(&self, _ctx: &Context, value: i32) -> Result<i32, Failure<i32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(value)
            } else {
                Err(Failure::new(
                    self.name.clone(),
                    value,
                    CodedError::boxed("test.transient", "not yet"),
                    Duration::ZERO,
                ))
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[tokio::test]
    async fn doubles_delay_between_attempts() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let child: Arc<dyn Processor<i32>> = Arc::new(CountingFail {
            name: "flaky".into(),
            succeed_on: 3,
            calls: calls.clone(),
        });
        let clock = StdArc::new(TestClock::new());
        let backoff = Backoff::new("backoff", child, 5, Duration::from_millis(10)).with_clock(clock.clone());

        let ctx = Context::background();
        let mut run = tokio::spawn(async move { backoff.process(&ctx, 1).await });

        // Wait for the task to actually park in `Clock::sleep` before
        // advancing, rather than guessing with a fixed number of yields —
        // `block_until_ready` resolves exactly when a sleep is pending.
        let out = loop {
            tokio::select! {
                res = &mut run => break res.unwrap().unwrap(),
                _ = clock.block_until_ready() => {
                    clock.advance(Duration::from_secs(3600));
                }
            }
        };
        assert_eq!(out, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_sleep_after_final_attempt() {
        // A single-attempt Backoff never enters the inter-attempt delay
        // path, since its only attempt is also its last — this must return
        // immediately even with an enormous base delay and a clock that is
        // never advanced.
        let calls = StdArc::new(AtomicUsize::new(0));
        let child: Arc<dyn Processor<i32>> = Arc::new(CountingFail {
            name: "always-fails".into(),
            succeed_on: 100,
            calls: calls.clone(),
        });
        let clock = StdArc::new(TestClock::new());
        let backoff = Backoff::new("backoff", child, 1, Duration::from_secs(3600)).with_clock(clock.clone());
        let err = tokio::time::timeout(Duration::from_secs(2), backoff.process(&Context::background(), 1))
            .await
            .expect("should not hang waiting on a post-exhaustion sleep")
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.path, vec!["backoff".to_string(), "always-fails".to_string()]);
    }
}
