//! Generalized race: the first result that also satisfies a predicate wins.

use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{codes, CloseErrors, CodedError, Failure};
use crate::observability::{MetricsProvider, Tracer};
use crate::panic::guard;
use crate::processor::Processor;

use super::race::spawn_fanout;
use super::util::default_metrics;

type ConditionFn<T> = Arc<dyn Fn(&Context, &T) -> bool + Send + Sync>;

/// Structurally identical to [`super::race::Race`], but a successful
/// child result only wins if `condition(ctx, &result)` also holds.
pub struct Contest<T: Send + Sync + Clone + 'static> {
    name: String,
    condition: ConditionFn<T>,
    children: RwLock<Vec<Arc<dyn Processor<T>>>>,
    metrics: Arc<dyn MetricsProvider>,
    tracer: Tracer,
}

impl<T: Send + Sync + Clone + 'static> Contest<T> {
    /// Both a condition and at least one child are required; both are
    /// re-checked at `Process` time with specific failure messages, rather
    /// than only at construction.
    pub fn new<F>(name: impl Into<String>, condition: F, children: Vec<Arc<dyn Processor<T>>>) -> Self
    where
        F: Fn(&Context, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            condition: Arc::new(condition),
            children: RwLock::new(children),
            metrics: default_metrics(),
            tracer: Tracer::new("contest"),
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

    fn snapshot(&self) -> Vec<Arc<dyn Processor<T>>> {
        self.children.read().unwrap().clone()
    }
}

fn eval_condition<'a, T>(condition: &'a ConditionFn<T>, ctx: &'a Context, value: &'a T) -> impl Future<Output = bool> + 'a {
    let condition = condition.clone();
    async move { condition(ctx, value) }
}

#[async_trait]
impl<T: Send + Sync + Clone + 'static> Processor<T> for Contest<T> {
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let children = self.snapshot();
        if children.is_empty() {
            return Err(Failure::new(
                self.name.clone(),
                value,
                CodedError::boxed(codes::EMPTY_FANOUT, "contest has no processors"),
                std::time::Duration::ZERO,
            ));
        }

        let (derived, cancel) = ctx.with_cancel();
        let mut rx = spawn_fanout(&children, &derived, &value, &self.tracer);

        let mut last_failure: Option<Failure<T>> = None;
        let mut any_success_rejected = false;
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
                    return Ok(value);
                }
                msg = rx.recv() => {
                    received += 1;
                    match msg {
                        Some((_idx, Ok(result))) => {
                            let accepted = match guard(eval_condition(&self.condition, &derived, &result)).await {
                                Ok(accepted) => accepted,
                                Err(panic_cause) => {
                                    cancel.cancel();
                                    return Err(Failure::new(self.name.clone(), result, panic_cause, std::time::Duration::ZERO));
                                }
                            };
                            if accepted {
                                cancel.cancel();
                                self.metrics.counter("contest.wins.total").increment();
                                return Ok(result);
                            }
                            any_success_rejected = true;
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
        self.metrics.counter("contest.no_winner.total").increment();

        let mut failure = if any_success_rejected || last_failure.is_none() {
            Failure::new(
                self.name.clone(),
                value,
                CodedError::boxed(
                    codes::CONTEST_NO_MATCH,
                    "no processor results met the specified condition",
                ),
                std::time::Duration::ZERO,
            )
        } else {
            let inner = last_failure.expect("checked above");
            let (recovered_value, meta) = super::util::split_failure(inner);
            let mut rejoined = super::util::rejoin_failure(recovered_value, meta);
            rejoined.err = CodedError::boxed(codes::CONTEST_ALL_FAILED, "all processors failed");
            rejoined
        };
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
