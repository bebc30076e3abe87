//! Fans the input out to every child; the first success wins and cancels
//! the rest.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::context::Context;
use crate::error::{codes, CloseErrors, CodedError, Failure};
use crate::observability::{MetricsProvider, Tracer};
use crate::processor::Processor;

use super::util::default_metrics;

/// Requires `T: Clone`: each child gets its own independent copy so a
/// losing child can keep running harmlessly after the race is decided.
pub struct Race<T: Send + Sync + Clone + 'static> {
    name: String,
    children: RwLock<Vec<Arc<dyn Processor<T>>>>,
    metrics: Arc<dyn MetricsProvider>,
    tracer: Tracer,
}

impl<T: Send + Sync + Clone + 'static> Race<T> {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Processor<T>>>) -> Self {
        Self {
            name: name.into(),
            children: RwLock::new(children),
            metrics: default_metrics(),
            tracer: Tracer::new("race"),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn set_processors(&self, processors: Vec<Arc<dyn Processor<T>>>) {
        *self.children.write().unwrap() = processors;
    }

    pub fn get_processors(&self) -> Vec<Arc<dyn Processor<T>>> {
        self.children.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.children.read().unwrap().len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Processor<T>>> {
        self.children.read().unwrap().clone()
    }
}

/// Spawns every child against `derived`, each attempting a non-blocking
/// send of its outcome once it completes. A child whose derived context is
/// already done by the time it finishes abandons the send rather than
/// blocking on a full or closed channel — this is what keeps a losing
/// child's late completion from wedging anything.
pub(super) fn spawn_fanout<T: Send + Sync + Clone + 'static>(
    children: &[Arc<dyn Processor<T>>],
    derived: &Context,
    value: &T,
    tracer: &Tracer,
) -> mpsc::Receiver<(usize, Result<T, Failure<T>>)> {
    let (tx, rx) = mpsc::channel(children.len().max(1));
    for (idx, child) in children.iter().enumerate() {
        let child = child.clone();
        let input = value.clone();
        let child_ctx = derived.clone();
        let tx = tx.clone();
        let span = tracer.start_attempt(child.name(), idx + 1);
        let record_span = span.clone();
        let tracer = *tracer;
        tokio::spawn(
            async move {
                let outcome = child.process(&child_ctx, input).await;
                match &outcome {
                    Ok(_) => tracer.record_outcome(&record_span, "success", None),
                    Err(failure) => {
                        tracer.record_outcome(&record_span, "failure", Some(&failure.to_string()))
                    }
                }
                if !child_ctx.is_done() {
                    let _ = tx.try_send((idx, outcome));
                }
            }
            .instrument(span),
        );
    }
    rx
}

#[async_trait]
impl<T: Send + Sync + Clone + 'static> Processor<T> for Race<T> {
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let children = self.snapshot();
        if children.is_empty() {
            return Err(Failure::new(
                self.name.clone(),
                value,
                CodedError::boxed(codes::EMPTY_FANOUT, "race has no processors"),
                std::time::Duration::ZERO,
            ));
        }

        let (derived, cancel) = ctx.with_cancel();
        let mut rx = spawn_fanout(&children, &derived, &value, &self.tracer);

        let mut last_failure: Option<Failure<T>> = None;
        let total = children.len();
        let mut received = 0usize;

        loop {
            if received >= total {
                break;
            }
            tokio::select! {
                biased;
                _ = ctx.done() => {
                    cancel.cancel();
                    self.metrics.counter("race.caller_canceled.total").increment();
                    return Ok(value);
                }
                msg = rx.recv() => {
                    received += 1;
                    match msg {
                        Some((_idx, Ok(result))) => {
                            cancel.cancel();
                            self.metrics.counter("race.wins.total").increment();
                            return Ok(result);
                        }
                        Some((_idx, Err(failure))) => {
                            last_failure = Some(failure);
                        }
                        None => break,
                    }
                }
            }
        }

        cancel.cancel();
        self.metrics.counter("race.all_failed.total").increment();
        let mut failure = last_failure.unwrap_or_else(|| {
            Failure::new(
                self.name.clone(),
                value,
                CodedError::boxed(codes::EMPTY_FANOUT, "race had no successful or failed results"),
                std::time::Duration::ZERO,
            )
        });
        failure.push_front_path(self.name.clone());
        Err(failure)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) -> Result<(), CloseErrors> {
        let mut errors = CloseErrors::default();
        for child in self.children.read().unwrap().iter() {
            errors.absorb(child.close());
        }
        errors.into_result()
    }
}
