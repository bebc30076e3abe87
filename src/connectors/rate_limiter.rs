//! Token-bucket admission control.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::Instrument;

use crate::clock::{Clock, SystemClock};
use crate::context::{DoneReason, Context};
use crate::error::{codes, CodedError, Failure};
use crate::observability::{MetricsProvider, Tracer};
use crate::processor::Processor;

use super::util::default_metrics;

pub const MODE_WAIT: &str = "wait";
pub const MODE_DROP: &str = "drop";

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    burst: i32,
    mode: String,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        if self.rate.is_infinite() {
            self.tokens = self.burst as f64;
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst as f64);
        self.last_refill = now;
    }
}

/// Gates a pipeline on a lazily-refilled token bucket. `rate` is tokens per
/// second and may be `0.0` (never refills on its own) or `f64::INFINITY`
/// (always admits). The bucket starts full.
pub struct RateLimiter<T: Send + Sync + 'static> {
    name: String,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsProvider>,
    tracer: Tracer,
    _marker: std::marker::PhantomData<fn(&T)>,
}

impl<T: Send + Sync + 'static> RateLimiter<T> {
    pub fn new(name: impl Into<String>, rate: f64, burst: i32, mode: impl Into<String>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            name: name.into(),
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: clock.now(),
                rate,
                burst,
                mode: mode.into(),
            }),
            clock,
            metrics: default_metrics(),
            tracer: Tracer::new("rate_limiter"),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        {
            let mut state = self.state.lock().unwrap();
            state.last_refill = now;
        }
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn get_rate(&self) -> f64 {
        self.state.lock().unwrap().rate
    }

    pub fn set_rate(&self, rate: f64) {
        self.state.lock().unwrap().rate = rate;
    }

    pub fn get_burst(&self) -> i32 {
        self.state.lock().unwrap().burst
    }

    /// Lowering the burst immediately caps any surplus accumulated tokens.
    pub fn set_burst(&self, burst: i32) {
        let mut state = self.state.lock().unwrap();
        state.burst = burst;
        state.tokens = state.tokens.min(burst as f64);
    }

    pub fn get_mode(&self) -> String {
        self.state.lock().unwrap().mode.clone()
    }

    /// An unrecognized mode is silently ignored; the current mode stands.
    pub fn set_mode(&self, mode: impl Into<String>) {
        let mode = mode.into();
        if mode == MODE_WAIT || mode == MODE_DROP {
            self.state.lock().unwrap().mode = mode;
        }
    }

    pub fn get_available_tokens(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        state.refill(self.clock.now());
        state.tokens
    }

    /// Refills and attempts to take a token under one lock acquisition.
    /// Returns `Ok(true)` on admission, `Ok(false)` if the caller must wait
    /// `Duration` (wait mode only reaches this branch), or `Err` for an
    /// unknown mode or immediate drop-mode rejection.
    fn try_admit(&self) -> Result<bool, RateLimitDenial> {
        let mut state = self.state.lock().unwrap();
        state.refill(self.clock.now());

        if state.rate.is_infinite() {
            return Ok(true);
        }
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(true);
        }
        match state.mode.as_str() {
            MODE_DROP => Err(RateLimitDenial::Exceeded),
            MODE_WAIT => Ok(false),
            _ => Err(RateLimitDenial::UnknownMode),
        }
    }

    fn wait_duration(&self) -> Duration {
        let state = self.state.lock().unwrap();
        if state.rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(((1.0 - state.tokens) / state.rate).max(0.0))
    }

    fn take_token_after_wait(&self) {
        let mut state = self.state.lock().unwrap();
        state.refill(self.clock.now());
        state.tokens = (state.tokens - 1.0).max(0.0);
    }
}

enum RateLimitDenial {
    Exceeded,
    UnknownMode,
}

#[async_trait]
impl<T: Send + Sync + 'static> Processor<T> for RateLimiter<T> {
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let admission_span = self.tracer.start(&self.name);
        let admission = admission_span.in_scope(|| self.try_admit());

        match admission {
            Ok(true) => {
                self.tracer.record_outcome(&admission_span, "success", None);
                self.metrics.counter("rate_limiter.admitted.total").increment();
                return Ok(value);
            }
            Err(RateLimitDenial::Exceeded) => {
                self.tracer
                    .record_outcome(&admission_span, "failure", Some("rate limit exceeded"));
                self.metrics.counter("rate_limiter.dropped.total").increment();
                let mut failure = Failure::new(
                    self.name.clone(),
                    value,
                    CodedError::boxed(codes::RATE_LIMIT_EXCEEDED, "rate limit exceeded"),
                    Duration::ZERO,
                );
                failure.path = vec![self.name.clone()];
                return Err(failure);
            }
            Err(RateLimitDenial::UnknownMode) => {
                self.tracer.record_outcome(
                    &admission_span,
                    "failure",
                    Some("unknown rate limiter mode"),
                );
                self.metrics.counter("rate_limiter.unknown_mode.total").increment();
                return Err(Failure::new(
                    self.name.clone(),
                    value,
                    CodedError::boxed(codes::RATE_LIMITER_UNKNOWN_MODE, "unknown rate limiter mode"),
                    Duration::ZERO,
                ));
            }
            Ok(false) => {}
        }

        let wait = self.wait_duration();
        let span = self.tracer.start_attempt(&self.name, 0);
        let record_span = span.clone();
        let tracer = self.tracer;
        async move {
            let outcome = tokio::select! {
                _ = self.clock.sleep(wait) => {
                    self.take_token_after_wait();
                    self.metrics.counter("rate_limiter.admitted_after_wait.total").increment();
                    Ok(value)
                }
                _ = ctx.done() => {
                    self.metrics.counter("rate_limiter.wait_canceled.total").increment();
                    let reason = ctx.err();
                    let cause = match reason {
                        Some(DoneReason::DeadlineExceeded) => {
                            CodedError::boxed("context.deadline_exceeded", "context deadline exceeded while waiting for rate limiter")
                        }
                        _ => CodedError::boxed("context.canceled", "context canceled while waiting for rate limiter"),
                    };
                    let failure = Failure::new(self.name.clone(), value, cause, Duration::ZERO);
                    Err(match reason {
                        Some(DoneReason::DeadlineExceeded) => failure.with_timeout_flag(),
                        _ => failure.with_canceled_flag(),
                    })
                }
            };
            match &outcome {
                Ok(_) => tracer.record_outcome(&record_span, "success", None),
                Err(failure) => {
                    tracer.record_outcome(&record_span, "failure", Some(&failure.to_string()))
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
