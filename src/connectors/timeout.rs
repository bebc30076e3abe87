//! Wraps a single child with a hard deadline, running it on its own task.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::Instrument;

use crate::clock::{Clock, SystemClock};
use crate::context::Context;
use crate::error::{CloseErrors, Failure};
use crate::observability::{MetricsProvider, Tracer};
use crate::panic::join_error_to_cause;
use crate::processor::Processor;

use super::util::{context_done_failure, default_metrics};

/// Runs its child on a spawned task and races it against a derived
/// deadline. A late child result (arriving after the deadline already won)
/// is discarded rather than awaited.
///
/// # Why `T: Clone`
/// If the deadline fires before the child task finishes, `Timeout` must
/// still hand back the original input — but that input was already moved
/// into the spawned task so the child can own it while it runs. Rather than
/// smuggling a shared reference across the task boundary, `Timeout` keeps a
/// clone in the caller's task for exactly this path and sends the other
/// into the child, the same `T: Clone` precondition the other fan-out
/// connectors already require.
pub struct Timeout<T: Send + Sync + 'static> {
    name: String,
    child: Arc<dyn Processor<T>>,
    duration: RwLock<Duration>,
    clock: RwLock<Arc<dyn Clock>>,
    metrics: Arc<dyn MetricsProvider>,
    tracer: Tracer,
}

impl<T: Send + Sync + 'static> Timeout<T> {
    pub fn new(name: impl Into<String>, child: Arc<dyn Processor<T>>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            child,
            duration: RwLock::new(duration),
            clock: RwLock::new(Arc::new(SystemClock)),
            metrics: default_metrics(),
            tracer: Tracer::new("timeout"),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn get_duration(&self) -> Duration {
        *self.duration.read().unwrap()
    }

    pub fn set_duration(&self, duration: Duration) {
        *self.duration.write().unwrap() = duration;
    }

    pub fn with_clock(&self, clock: Arc<dyn Clock>) {
        *self.clock.write().unwrap() = clock;
    }
}

#[async_trait]
impl<T: Send + Sync + Clone + 'static> Processor<T> for Timeout<T> {
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let start = Instant::now();
        let duration = self.get_duration();
        let base = ctx.with_clock(self.clock.read().unwrap().clone());
        let (derived, cancel) = base.with_timeout(duration);

        let child = self.child.clone();
        let child_value = value.clone();
        let span = self.tracer.start_attempt(child.name(), 1);
        let attempt_span = span.clone();
        let child_ctx = derived.clone();
        let handle = tokio::spawn(
            async move { child.process(&child_ctx, child_value).await }.instrument(span),
        );

        let result = tokio::select! {
            biased;
            joined = handle => {
                match joined {
                    Ok(Ok(result)) => {
                        self.tracer.record_outcome(&attempt_span, "success", None);
                        Ok(result)
                    }
                    Ok(Err(mut failure)) => {
                        self.tracer
                            .record_outcome(&attempt_span, "failure", Some(&failure.to_string()));
                        failure.push_front_path(self.name.clone());
                        Err(failure)
                    }
                    Err(join_err) => {
                        let cause = join_error_to_cause(join_err);
                        self.tracer
                            .record_outcome(&attempt_span, "panic", Some(&cause.to_string()));
                        Err(Failure::new(self.name.clone(), value, cause, start.elapsed()))
                    }
                }
            }
            _ = derived.done() => {
                self.tracer.record_outcome(&attempt_span, "timeout", None);
                Err(context_done_failure(&self.name, value, &derived))
            }
        };

        cancel.cancel();
        result
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) -> Result<(), CloseErrors> {
        self.child.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Transform;
    use crate::clock::TestClock;

    fn ctx() -> Context {
        Context::background()
    }

    #[tokio::test]
    async fn completes_before_deadline() {
        let child: Arc<dyn Processor<i32>> = Arc::new(Transform::new("double", |_ctx: &Context, v: &i32| {
            let v = *v;
            async move { v * 2 }
        }));
        let timeout = Timeout::new("timeout", child, Duration::from_secs(5));
        let out = timeout.process(&ctx(), 10).await.unwrap();
        assert_eq!(out, 20);
    }

    #[tokio::test]
    async fn fires_before_child_completes() {
        let child: Arc<dyn Processor<i32>> = Arc::new(Transform::new("slow", |_ctx: &Context, v: &i32| {
            let v = *v;
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                v
            }
        }));
        let clock = Arc::new(TestClock::new());
        let timeout = Timeout::new("timeout", child, Duration::from_millis(10));
        timeout.with_clock(clock.clone());

        let mut run = tokio::spawn(async move { timeout.process(&Context::background(), 7).await });
        let err = loop {
            tokio::select! {
                res = &mut run => break res.unwrap().unwrap_err(),
                _ = clock.block_until_ready() => {
                    clock.advance(Duration::from_secs(3600));
                }
            }
        };
        assert!(err.is_timeout());
        assert_eq!(err.input_data, 7);
    }
}
