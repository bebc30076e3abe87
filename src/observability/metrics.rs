//! Typed counters and gauges keyed by string constants.
//!
//! # Why
//! The engine defines the metrics seam but does not prescribe a backend.
//! [`InMemoryMetrics`] is the default, test-friendly implementation;
//! production deployments can supply their own [`MetricsProvider`] (e.g.
//! backed by `prometheus` or an OTel exporter) — wiring that transport is an
//! external collaborator, not this crate's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A monotonically-increasing counter.
pub trait Counter: Send + Sync {
    fn add(&self, value: u64);
    fn increment(&self) {
        self.add(1);
    }
    fn value(&self) -> u64;
}

/// A measurement that can move up or down (e.g. current child count).
pub trait Gauge: Send + Sync {
    fn set(&self, value: f64);
    fn value(&self) -> f64;
}

/// Creates or fetches named counters and gauges. Implementors must be safe
/// to call concurrently with in-flight `Process` calls.
pub trait MetricsProvider: Send + Sync {
    fn counter(&self, name: &'static str) -> Arc<dyn Counter>;
    fn gauge(&self, name: &'static str) -> Arc<dyn Gauge>;
}

#[derive(Default)]
struct InMemoryCounter(AtomicU64);

impl Counter for InMemoryCounter {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct InMemoryGauge(AtomicU64);

impl Gauge for InMemoryGauge {
    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn value(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// In-process metrics registry: counters and gauges are stored in a map
/// guarded by a `RwLock`, consistent with the engine's "snapshot under a
/// read lock, mutate under a write lock" policy elsewhere.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: RwLock<HashMap<&'static str, Arc<InMemoryCounter>>>,
    gauges: RwLock<HashMap<&'static str, Arc<InMemoryGauge>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads back the current value of a named counter, mostly useful in
    /// tests that assert on emitted metrics.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .read()
            .unwrap()
            .get(name)
            .map(|c| c.value())
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> f64 {
        self.gauges
            .read()
            .unwrap()
            .get(name)
            .map(|g| g.value())
            .unwrap_or(0.0)
    }
}

impl MetricsProvider for InMemoryMetrics {
    fn counter(&self, name: &'static str) -> Arc<dyn Counter> {
        if let Some(c) = self.counters.read().unwrap().get(name) {
            return c.clone();
        }
        let mut write = self.counters.write().unwrap();
        write
            .entry(name)
            .or_insert_with(|| Arc::new(InMemoryCounter::default()))
            .clone()
    }

    fn gauge(&self, name: &'static str) -> Arc<dyn Gauge> {
        if let Some(g) = self.gauges.read().unwrap().get(name) {
            return g.clone();
        }
        let mut write = self.gauges.write().unwrap();
        write
            .entry(name)
            .or_insert_with(|| Arc::new(InMemoryGauge::default()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_by_name() {
        let metrics = InMemoryMetrics::new();
        metrics.counter("sequence.processed.total").increment();
        metrics.counter("sequence.processed.total").add(4);
        assert_eq!(metrics.counter_value("sequence.processed.total"), 5);
    }

    #[test]
    fn gauges_hold_latest_value() {
        let metrics = InMemoryMetrics::new();
        metrics.gauge("race.children").set(3.0);
        assert_eq!(metrics.gauge_value("race.children"), 3.0);
    }
}
