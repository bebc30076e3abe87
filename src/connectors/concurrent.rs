//! Fans the input out to every child for its side effects only.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::Instrument;

use crate::context::Context;
use crate::error::{CloseErrors, Failure};
use crate::observability::{MetricsProvider, Tracer};
use crate::processor::Processor;

use super::util::{context_done_failure, default_metrics};

/// Launches every child on its own task with an independent clone of the
/// input, waits for all of them (or for the caller's context to finish,
/// whichever comes first), and always returns the original input — child
/// outputs and errors are discarded. Requires `T: Clone` since every child
/// needs its own independent copy to mutate without racing the others.
pub struct Concurrent<T: Send + Sync + Clone + 'static> {
    name: String,
    children: RwLock<Vec<Arc<dyn Processor<T>>>>,
    metrics: Arc<dyn MetricsProvider>,
    tracer: Tracer,
}

impl<T: Send + Sync + Clone + 'static> Concurrent<T> {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Processor<T>>>) -> Self {
        Self {
            name: name.into(),
            children: RwLock::new(children),
            metrics: default_metrics(),
            tracer: Tracer::new("concurrent"),
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

#[async_trait]
impl<T: Send + Sync + Clone + 'static> Processor<T> for Concurrent<T> {
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let children = self.snapshot();
        let (derived, cancel) = ctx.with_cancel();

        let mut handles = Vec::with_capacity(children.len());
        for child in &children {
            let child = child.clone();
            let input = value.clone();
            let child_ctx = derived.clone();
            let span = self.tracer.start_attempt(child.name(), 0);
            let record_span = span.clone();
            let tracer = self.tracer;
            handles.push(tokio::spawn(
                async move {
                    let outcome = child.process(&child_ctx, input).await;
                    match &outcome {
                        Ok(_) => tracer.record_outcome(&record_span, "success", None),
                        Err(failure) => {
                            tracer.record_outcome(&record_span, "failure", Some(&failure.to_string()))
                        }
                    }
                }
                .instrument(span),
            ));
        }

        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        tokio::select! {
            _ = join_all => {
                cancel.cancel();
                self.metrics.counter("concurrent.completed.total").increment();
                Ok(value)
            }
            _ = ctx.done() => {
                cancel.cancel();
                Err(context_done_failure(&self.name, value, ctx))
            }
        }
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
