//! Small pieces shared by every connector implementation.

use std::sync::Arc;
use std::time::Duration;

use crate::context::{Context, DoneReason};
use crate::error::{CodedError, ErrorCause, Failure};
use crate::observability::{InMemoryMetrics, MetricsProvider};

/// Every connector starts with its own private [`InMemoryMetrics`] registry
/// unless a caller swaps in another [`MetricsProvider`]; this is the default.
pub(crate) fn default_metrics() -> Arc<dyn MetricsProvider> {
    Arc::new(InMemoryMetrics::new())
}

/// Builds the structured failure a connector returns when it notices the
/// caller's context is already done before dispatching to a child, tagging
/// the timeout/canceled flags from [`Context::err`].
pub(crate) fn context_done_failure<T>(name: &str, value: T, ctx: &Context) -> Failure<T> {
    let reason = ctx.err();
    let cause: ErrorCause = match reason {
        Some(DoneReason::DeadlineExceeded) => {
            CodedError::boxed("context.deadline_exceeded", "context deadline exceeded")
        }
        _ => CodedError::boxed("context.canceled", "context canceled"),
    };
    let failure = Failure::new(name.to_string(), value, cause, Duration::ZERO);
    match reason {
        Some(DoneReason::DeadlineExceeded) => failure.with_timeout_flag(),
        _ => failure.with_canceled_flag(),
    }
}

/// The non-`T` parts of a [`Failure`], split off so a connector can recover
/// everything about a child's failure except the value it carries — used
/// when the connector already holds its own original input and only needs
/// the error/path/timing to build its own outward-facing `Failure`.
pub(crate) type FailureMeta = (
    std::time::SystemTime,
    Duration,
    ErrorCause,
    Vec<String>,
    bool,
    bool,
);

pub(crate) fn split_failure<T>(failure: Failure<T>) -> (T, FailureMeta) {
    (
        failure.input_data,
        (
            failure.timestamp,
            failure.duration,
            failure.err,
            failure.path,
            failure.timeout,
            failure.canceled,
        ),
    )
}

pub(crate) fn rejoin_failure<T>(value: T, meta: FailureMeta) -> Failure<T> {
    let (timestamp, duration, err, path, timeout, canceled) = meta;
    Failure {
        input_data: value,
        timestamp,
        duration,
        err,
        path,
        timeout,
        canceled,
    }
}
