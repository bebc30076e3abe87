//! Tries children in order; returns the first success.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::Instrument;

use crate::context::Context;
use crate::error::{codes, CloseErrors, CodedError, Failure};
use crate::observability::{EventBus, MetricsProvider, Tracer};
use crate::processor::Processor;

use super::util::{default_metrics, rejoin_failure, split_failure, FailureMeta};

#[derive(Debug, Clone)]
pub enum FallbackEvent {
    /// A child failed and the next candidate will be tried.
    Activated { failed: String, next: String },
    /// A non-first child succeeded.
    Recovered { winner: String, attempt: usize },
    /// Every child failed.
    Exhausted { attempts: usize },
}

/// Holds at least one child (enforced at construction). Tries each in
/// declared order, never in parallel; returns the first success or, if all
/// fail, the last failure with this connector's name prepended and the
/// original input it was called with restored as `input_data`.
///
/// # Why `T: Clone`
/// Every candidate must see the same original value `Fallback` was called
/// with, not whatever a composite child's own `Failure::input_data` happens
/// to record for itself (a composite may report its internally-transformed
/// value at the point of failure rather than its own input). So `Fallback`
/// keeps the original value and clones it for each candidate in turn, the
/// same `T: Clone` precondition `Concurrent`/`Race`/`Contest`/`Timeout`
/// already require.
pub struct Fallback<T: Send + Sync + 'static> {
    name: String,
    children: RwLock<Vec<Arc<dyn Processor<T>>>>,
    metrics: Arc<dyn MetricsProvider>,
    tracer: Tracer,
    events: EventBus<FallbackEvent>,
}

impl<T: Send + Sync + 'static> Fallback<T> {
    /// Panics if `children` is empty — a `Fallback` must guard at least one
    /// candidate at construction time.
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Processor<T>>>) -> Self {
        assert!(
            !children.is_empty(),
            "Fallback requires at least one processor"
        );
        Self {
            name: name.into(),
            children: RwLock::new(children),
            metrics: default_metrics(),
            tracer: Tracer::new("fallback"),
            events: EventBus::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn on_event(&self, handler: impl Fn(FallbackEvent) + Send + Sync + 'static) {
        self.events.subscribe(handler);
    }

    pub fn add_fallback(&self, processor: Arc<dyn Processor<T>>) {
        self.children.write().unwrap().push(processor);
    }

    pub fn insert_at(&self, index: usize, processor: Arc<dyn Processor<T>>) {
        let mut children = self.children.write().unwrap();
        let index = index.min(children.len());
        children.insert(index, processor);
    }

    /// Fails when only one child remains, since a `Fallback` can never drop
    /// to zero candidates.
    pub fn remove_at(&self, index: usize) -> Result<(), CodedError> {
        let mut children = self.children.write().unwrap();
        if children.len() <= 1 {
            return Err(CodedError::new(
                codes::FALLBACK_LAST_REMAINING,
                "cannot remove the last remaining fallback candidate",
            ));
        }
        if index >= children.len() {
            return Err(CodedError::new(
                codes::NAME_NOT_FOUND,
                format!("index {index} out of bounds"),
            ));
        }
        children.remove(index);
        Ok(())
    }

    /// Replaces the whole candidate list. Panics on empty input, matching
    /// the constructor's invariant.
    pub fn set_processors(&self, processors: Vec<Arc<dyn Processor<T>>>) {
        assert!(
            !processors.is_empty(),
            "Fallback requires at least one processor"
        );
        *self.children.write().unwrap() = processors;
    }

    pub fn get_processors(&self) -> Vec<Arc<dyn Processor<T>>> {
        self.children.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.children.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn Processor<T>>> {
        self.children.read().unwrap().clone()
    }
}

#[async_trait]
impl<T: Send + Sync + Clone + 'static> Processor<T> for Fallback<T> {
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let children = self.snapshot();
        let mut last_meta: Option<FailureMeta> = None;

        for (attempt, child) in children.iter().enumerate() {
            let span = self.tracer.start_attempt(child.name(), attempt + 1);
            match child.process(ctx, value.clone()).instrument(span.clone()).await {
                Ok(result) => {
                    self.tracer.record_outcome(&span, "success", None);
                    if attempt > 0 {
                        self.metrics.counter("fallback.recovered.total").increment();
                        self.events.emit(FallbackEvent::Recovered {
                            winner: child.name().to_string(),
                            attempt: attempt + 1,
                        });
                    }
                    return Ok(result);
                }
                Err(failure) => {
                    self.tracer
                        .record_outcome(&span, "failure", Some(&failure.to_string()));
                    let has_next = attempt + 1 < children.len();
                    if has_next {
                        self.events.emit(FallbackEvent::Activated {
                            failed: child.name().to_string(),
                            next: children[attempt + 1].name().to_string(),
                        });
                    }
                    let (_, meta) = split_failure(failure);
                    last_meta = Some(meta);
                }
            }
        }

        self.metrics.counter("fallback.exhausted.total").increment();
        self.events.emit(FallbackEvent::Exhausted {
            attempts: children.len(),
        });

        let meta = last_meta.expect("Fallback always has at least one child");
        let mut failure = rejoin_failure(value, meta);
        failure.push_front_path(self.name.clone());
        Err(failure)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) -> Result<(), CloseErrors> {
        self.events.close();
        let mut errors = CloseErrors::default();
        for child in self.children.read().unwrap().iter() {
            errors.absorb(child.close());
        }
        errors.into_result()
    }
}
