//! Observability substrate shared by every connector: metrics, tracing, and
//! an asynchronous domain-event bus.

pub mod events;
pub mod metrics;
pub mod trace;

pub use events::EventBus;
pub use metrics::{Counter, Gauge, InMemoryMetrics, MetricsProvider};
pub use trace::Tracer;
