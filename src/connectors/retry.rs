//! Retries a single child with the original input, no carry-over between
//! attempts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use crate::context::Context;
use crate::error::{CloseErrors, Failure};
use crate::observability::{EventBus, MetricsProvider, Tracer};
use crate::processor::Processor;

use super::util::{context_done_failure, default_metrics};

#[derive(Debug, Clone)]
pub enum RetryEvent {
    AttemptStart { attempt: usize },
    AttemptFail { attempt: usize, error: String },
    Exhausted { attempts: usize },
}

/// Wraps one child, calling it up to `max_attempts` times with the same
/// input on every attempt until it succeeds.
pub struct Retry<T: Send + Sync + 'static> {
    name: String,
    child: Arc<dyn Processor<T>>,
    max_attempts: usize,
    metrics: Arc<dyn MetricsProvider>,
    tracer: Tracer,
    events: EventBus<RetryEvent>,
}

impl<T: Send + Sync + 'static> Retry<T> {
    /// `max_attempts` below 1 is clamped up to 1 — a `Retry` always calls
    /// its child at least once.
    pub fn new(name: impl Into<String>, child: Arc<dyn Processor<T>>, max_attempts: i64) -> Self {
        Self {
            name: name.into(),
            child,
            max_attempts: max_attempts.max(1) as usize,
            metrics: default_metrics(),
            tracer: Tracer::new("retry"),
            events: EventBus::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn on_event(&self, handler: impl Fn(RetryEvent) + Send + Sync + 'static) {
        self.events.subscribe(handler);
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

#[async_trait]
impl<T: Send + Sync + Clone + 'static> Processor<T> for Retry<T> {
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        for attempt in 1..=self.max_attempts {
            self.events.emit(RetryEvent::AttemptStart { attempt });
            let span = self.tracer.start_attempt(self.child.name(), attempt);
            match self.child.process(ctx, value.clone()).instrument(span.clone()).await {
                Ok(result) => {
                    self.tracer.record_outcome(&span, "success", None);
                    return Ok(result);
                }
                Err(failure) => {
                    self.tracer
                        .record_outcome(&span, "failure", Some(&failure.to_string()));
                    self.events.emit(RetryEvent::AttemptFail {
                        attempt,
                        error: failure.to_string(),
                    });
                    self.metrics.counter("retry.attempt_failed.total").increment();

                    if attempt == self.max_attempts {
                        self.metrics.counter("retry.exhausted.total").increment();
                        self.events.emit(RetryEvent::Exhausted {
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
    use crate::error::{CodedError, ErrorCause};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn ctx() -> Context {
        Context::background()
    }

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
                Ok(value * 10)
            } else {
                Err(Failure::new(
                    self.name.clone(),
                    value,
                    CodedError::boxed("test.transient", "not yet"),
                    std::time::Duration::ZERO,
                ))
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let child: Arc<dyn Processor<i32>> = Arc::new(CountingFail {
            name: "flaky".into(),
            succeed_on: 3,
            calls: calls.clone(),
        });
        let retry = Retry::new("retry", child, 5);
        let out = retry.process(&ctx(), 4).await.unwrap();
        assert_eq!(out, 40);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts_with_name_prepended() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let child: Arc<dyn Processor<i32>> = Arc::new(CountingFail {
            name: "always-fails".into(),
            succeed_on: 100,
            calls: calls.clone(),
        });
        let retry = Retry::new("retry", child, 3);
        let err = retry.process(&ctx(), 1).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.path, vec!["retry".to_string(), "always-fails".to_string()]);
    }

    #[tokio::test]
    async fn retries_a_composite_child_with_the_original_value_every_attempt() {
        use crate::adapters::{Apply, Transform};
        use crate::connectors::Sequence;

        let seen = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let inc: Arc<dyn Processor<i32>> = Arc::new(Transform::new("inc", move |_ctx: &Context, v: &i32| {
            let v = *v;
            seen2.lock().unwrap().push(v);
            async move { v + 1 }
        }));
        let boom: Arc<dyn Processor<i32>> = Arc::new(Apply::new("boom", |_ctx: &Context, _v: &i32| async {
            Err::<i32, ErrorCause>(CodedError::boxed("test.boom", "boom"))
        }));
        let seq: Arc<dyn Processor<i32>> = Arc::new(Sequence::new("s", vec![inc, boom]));
        let retry = Retry::new("r", seq, 3);

        let err = retry.process(&ctx(), 5).await.unwrap_err();
        assert_eq!(*seen.lock().unwrap(), vec![5, 5, 5]);
        assert_eq!(err.input_data, 5);
    }

    #[test]
    fn max_attempts_clamps_to_one() {
        let child: Arc<dyn Processor<i32>> = Arc::new(CountingFail {
            name: "x".into(),
            succeed_on: 1,
            calls: StdArc::new(AtomicUsize::new(0)),
        });
        let retry = Retry::new("retry", child, -5);
        assert_eq!(retry.max_attempts(), 1);
    }
}
