//! Routing connector parameterized over a comparable route key.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use crate::context::Context;
use crate::error::{CloseErrors, Failure};
use crate::observability::{MetricsProvider, Tracer};
use crate::panic::guard;
use crate::processor::Processor;

use super::util::default_metrics;

type ConditionFn<T, K> = Arc<dyn Fn(&Context, &T) -> K + Send + Sync>;

/// Computes a route key from the value, then delegates to the matching
/// child. A value whose key has no registered route passes through
/// unchanged — "no-op on unknown key" is a deliberate policy, not a gap.
pub struct Switch<T, K>
where
    T: Send + Sync + 'static,
    K: Eq + Hash + Send + Sync + 'static,
{
    name: String,
    condition: RwLock<ConditionFn<T, K>>,
    routes: RwLock<HashMap<K, Arc<dyn Processor<T>>>>,
    metrics: Arc<dyn MetricsProvider>,
    tracer: Tracer,
}

impl<T, K> Switch<T, K>
where
    T: Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new<F>(name: impl Into<String>, condition: F) -> Self
    where
        F: Fn(&Context, &T) -> K + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            condition: RwLock::new(Arc::new(condition)),
            routes: RwLock::new(HashMap::new()),
            metrics: default_metrics(),
            tracer: Tracer::new("switch"),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn set_condition<F>(&self, condition: F)
    where
        F: Fn(&Context, &T) -> K + Send + Sync + 'static,
    {
        *self.condition.write().unwrap() = Arc::new(condition);
    }

    pub fn add_route(&self, key: K, processor: Arc<dyn Processor<T>>) {
        self.routes.write().unwrap().insert(key, processor);
    }

    pub fn remove_route(&self, key: &K) {
        self.routes.write().unwrap().remove(key);
    }

    pub fn has_route(&self, key: &K) -> bool {
        self.routes.read().unwrap().contains_key(key)
    }

    pub fn routes(&self) -> HashMap<K, Arc<dyn Processor<T>>> {
        self.routes.read().unwrap().clone()
    }

    pub fn set_routes(&self, routes: HashMap<K, Arc<dyn Processor<T>>>) {
        *self.routes.write().unwrap() = routes;
    }

    pub fn clear_routes(&self) {
        self.routes.write().unwrap().clear();
    }
}

#[async_trait]
impl<T, K> Processor<T> for Switch<T, K>
where
    T: Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let condition = self.condition.read().unwrap().clone();
        let key_result = guard(async_condition(&condition, ctx, &value)).await;
        let key = match key_result {
            Ok(k) => k,
            Err(panic_cause) => {
                return Err(Failure::new(self.name.clone(), value, panic_cause, Instant::now().elapsed()))
            }
        };

        let child = self.routes.read().unwrap().get(&key).cloned();
        match child {
            Some(child) => {
                let span = self.tracer.start(child.name());
                let outcome = child.process(ctx, value).instrument(span.clone()).await;
                match &outcome {
                    Ok(_) => self.tracer.record_outcome(&span, "success", None),
                    Err(failure) => {
                        self.tracer
                            .record_outcome(&span, "failure", Some(&failure.to_string()));
                    }
                }
                outcome.map_err(|mut failure| {
                    failure.push_front_path(self.name.clone());
                    failure
                })
            }
            None => {
                self.metrics.counter("switch.unmatched.total").increment();
                Ok(value)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) -> Result<(), CloseErrors> {
        let mut errors = CloseErrors::default();
        for child in self.routes.read().unwrap().values() {
            errors.absorb(child.close());
        }
        errors.into_result()
    }
}

/// Adapts a synchronous key-computation closure into a future so it can run
/// under the same panic guard every other connector uses.
fn async_condition<'a, T, K>(
    condition: &'a ConditionFn<T, K>,
    ctx: &'a Context,
    value: &'a T,
) -> impl Future<Output = K> + 'a {
    let condition = condition.clone();
    async move { condition(ctx, value) }
}
