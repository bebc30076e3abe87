//! Trace span emission via the `tracing` ecosystem crate.
//!
//! # Why
//! Every connector execution and child attempt opens a `tracing::Span`
//! tagged with processor name / attempt number / outcome / error string,
//! rather than hand-rolling span plumbing on top of a bespoke type.

use tracing::Span;

/// Thin per-connector handle exposed via `Connector::tracer()`, matching the
/// programmatic `Tracer()` getter. Each call opens a new
/// `tracing` span scoped to one `Process` invocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Tracer {
    pub connector_kind: &'static str,
}

impl Tracer {
    pub const fn new(connector_kind: &'static str) -> Self {
        Self { connector_kind }
    }

    /// Opens the span covering one `Process` call.
    pub fn start(&self, name: &str) -> Span {
        tracing::info_span!(
            "spark_flow.process",
            kind = self.connector_kind,
            processor = %name,
            outcome = tracing::field::Empty,
            error = tracing::field::Empty,
        )
    }

    /// Opens the span covering one child attempt, tagged with the attempt
    /// number (1-based) so retry/backoff/fallback traces show which attempt
    /// a given span belongs to.
    pub fn start_attempt(&self, name: &str, attempt: usize) -> Span {
        tracing::info_span!(
            "spark_flow.attempt",
            kind = self.connector_kind,
            processor = %name,
            attempt = attempt,
            outcome = tracing::field::Empty,
            error = tracing::field::Empty,
        )
    }

    /// Records the terminal outcome on the current span's fields.
    pub fn record_outcome(&self, span: &Span, outcome: &'static str, error: Option<&str>) {
        span.record("outcome", outcome);
        if let Some(err) = error {
            span.record("error", err);
        }
    }
}
