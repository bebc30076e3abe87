//! Ordered pipeline with a runtime mutation API.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use crate::context::Context;
use crate::error::{codes, CloseErrors, CodedError, Failure};
use crate::observability::{MetricsProvider, Tracer};
use crate::processor::Processor;

use super::util::{context_done_failure, default_metrics};

/// Runs children in order, feeding each one's output into the next.
pub struct Sequence<T: Send + Sync + 'static> {
    name: String,
    children: RwLock<Vec<Arc<dyn Processor<T>>>>,
    metrics: Arc<dyn MetricsProvider>,
    tracer: Tracer,
}

impl<T: Send + Sync + 'static> Sequence<T> {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Processor<T>>>) -> Self {
        Self {
            name: name.into(),
            children: RwLock::new(children),
            metrics: default_metrics(),
            tracer: Tracer::new("sequence"),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsProvider> {
        &self.metrics
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Appends children to the end.
    pub fn register(&self, ps: impl IntoIterator<Item = Arc<dyn Processor<T>>>) {
        self.children.write().unwrap().extend(ps);
    }

    /// Alias for [`Sequence::register`].
    pub fn push(&self, ps: impl IntoIterator<Item = Arc<dyn Processor<T>>>) {
        self.register(ps);
    }

    /// Prepends children, preserving their relative order.
    pub fn unshift(&self, ps: impl IntoIterator<Item = Arc<dyn Processor<T>>>) {
        let mut children = self.children.write().unwrap();
        let mut front: Vec<_> = ps.into_iter().collect();
        front.append(&mut children);
        *children = front;
    }

    /// Removes and returns the first child.
    pub fn shift(&self) -> Result<Arc<dyn Processor<T>>, CodedError> {
        let mut children = self.children.write().unwrap();
        if children.is_empty() {
            return Err(CodedError::new(codes::EMPTY_SEQUENCE, "sequence is empty"));
        }
        Ok(children.remove(0))
    }

    /// Removes and returns the last child.
    pub fn pop(&self) -> Result<Arc<dyn Processor<T>>, CodedError> {
        let mut children = self.children.write().unwrap();
        children
            .pop()
            .ok_or_else(|| CodedError::new(codes::EMPTY_SEQUENCE, "sequence is empty"))
    }

    pub fn len(&self) -> usize {
        self.children.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.children.write().unwrap().clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.children
            .read()
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    fn position_of(children: &[Arc<dyn Processor<T>>], name: &str) -> Option<usize> {
        children.iter().position(|p| p.name() == name)
    }

    fn not_found(name: &str) -> CodedError {
        CodedError::new(
            codes::NAME_NOT_FOUND,
            format!("no child named {name:?} in sequence"),
        )
    }

    pub fn remove(&self, name: &str) -> Result<(), CodedError> {
        let mut children = self.children.write().unwrap();
        let idx = Self::position_of(&children, name).ok_or_else(|| Self::not_found(name))?;
        children.remove(idx);
        Ok(())
    }

    pub fn replace(&self, name: &str, with: Arc<dyn Processor<T>>) -> Result<(), CodedError> {
        let mut children = self.children.write().unwrap();
        let idx = Self::position_of(&children, name).ok_or_else(|| Self::not_found(name))?;
        children[idx] = with;
        Ok(())
    }

    pub fn after(
        &self,
        name: &str,
        ps: impl IntoIterator<Item = Arc<dyn Processor<T>>>,
    ) -> Result<(), CodedError> {
        let mut children = self.children.write().unwrap();
        let idx = Self::position_of(&children, name).ok_or_else(|| Self::not_found(name))?;
        let mut rest = children.split_off(idx + 1);
        children.extend(ps);
        children.append(&mut rest);
        Ok(())
    }

    pub fn before(
        &self,
        name: &str,
        ps: impl IntoIterator<Item = Arc<dyn Processor<T>>>,
    ) -> Result<(), CodedError> {
        let mut children = self.children.write().unwrap();
        let idx = Self::position_of(&children, name).ok_or_else(|| Self::not_found(name))?;
        let mut rest = children.split_off(idx);
        children.extend(ps);
        children.append(&mut rest);
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<dyn Processor<T>>> {
        self.children.read().unwrap().clone()
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Processor<T> for Sequence<T> {
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let start = Instant::now();
        let children = self.snapshot();
        let mut current = value;

        for child in &children {
            if ctx.is_done() {
                return Err(context_done_failure(&self.name, current, ctx));
            }

            let span = self.tracer.start_attempt(child.name(), 0);
            match child.process(ctx, current).instrument(span.clone()).await {
                Ok(next) => {
                    self.tracer.record_outcome(&span, "success", None);
                    current = next;
                }
                Err(mut failure) => {
                    self.tracer
                        .record_outcome(&span, "failure", Some(&failure.to_string()));
                    failure.push_front_path(self.name.clone());
                    self.metrics.counter("sequence.failed.total").increment();
                    return Err(failure);
                }
            }
        }

        self.metrics.counter("sequence.processed.total").increment();
        self.metrics
            .gauge("sequence.last_duration_ms")
            .set(start.elapsed().as_secs_f64() * 1000.0);
        Ok(current)
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
