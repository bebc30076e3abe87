//! Observes failures without masking them.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::Instrument;

use crate::context::Context;
use crate::error::{CloseErrors, Failure};
use crate::observability::{MetricsProvider, Tracer};
use crate::processor::Processor;

use super::util::{default_metrics, split_failure};

/// Wraps a data processor and a separate error-observer processor whose
/// input is the data processor's own [`Failure`]. The observer's result and
/// any error it produces are discarded — it exists purely to be notified,
/// never to recover or rewrite the failure.
pub struct Handle<T: Send + Sync + 'static> {
    name: String,
    data: RwLock<Arc<dyn Processor<T>>>,
    error_handler: RwLock<Arc<dyn Processor<Failure<T>>>>,
    metrics: Arc<dyn MetricsProvider>,
    tracer: Tracer,
}

impl<T: Send + Sync + 'static> Handle<T> {
    pub fn new(
        name: impl Into<String>,
        data: Arc<dyn Processor<T>>,
        error_handler: Arc<dyn Processor<Failure<T>>>,
    ) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(data),
            error_handler: RwLock::new(error_handler),
            metrics: default_metrics(),
            tracer: Tracer::new("handle"),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn get_processor(&self) -> Arc<dyn Processor<T>> {
        self.data.read().unwrap().clone()
    }

    pub fn set_processor(&self, processor: Arc<dyn Processor<T>>) {
        *self.data.write().unwrap() = processor;
    }

    pub fn get_error_handler(&self) -> Arc<dyn Processor<Failure<T>>> {
        self.error_handler.read().unwrap().clone()
    }

    pub fn set_error_handler(&self, handler: Arc<dyn Processor<Failure<T>>>) {
        *self.error_handler.write().unwrap() = handler;
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Processor<T> for Handle<T> {
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let data = self.data.read().unwrap().clone();
        let span = self.tracer.start_attempt(data.name(), 1);
        let outcome = data.process(ctx, value).instrument(span.clone()).await;

        let mut failure = match outcome {
            Ok(result) => {
                self.tracer.record_outcome(&span, "success", None);
                return Ok(result);
            }
            Err(failure) => {
                self.tracer
                    .record_outcome(&span, "failure", Some(&failure.to_string()));
                failure
            }
        };

        let error_handler = self.error_handler.read().unwrap().clone();
        self.metrics.counter("handle.observed.total").increment();

        // The observer's own outcome is discarded either way; all that
        // matters is recovering the original failure it was handed back,
        // the same "value always comes back" contract every processor
        // honors on its own failure path.
        failure = match error_handler.process(ctx, failure).await {
            Ok(observed) => observed,
            Err(observer_failure) => split_failure(observer_failure).0,
        };

        failure.push_front_path(self.name.clone());
        Err(failure)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) -> Result<(), CloseErrors> {
        let mut errors = CloseErrors::default();
        errors.absorb(self.data.read().unwrap().close());
        errors.absorb(self.error_handler.read().unwrap().close());
        errors.into_result()
    }
}
