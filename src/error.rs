//! The structured failure type every connector produces, and the stable
//! error codes the crate's own structural failures carry.
//!
//! # Why
//! Stack traces are unnecessary and misleading once execution has crossed
//! task boundaries; instead every failure carries an explicit
//! `path` of processor names, built up one `push_front` at a time as the
//! failure propagates outward through nested connectors.

use std::fmt;
use std::time::{Duration, SystemTime};

/// Boxed underlying error, threadable across task boundaries.
pub type ErrorCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The single structured failure type produced anywhere in the engine.
///
/// Carries the original input (`input_data`), a wall-clock timestamp, the
/// elapsed duration since the outermost connector's entry, the wrapped
/// underlying error, the execution path, and the timeout/canceled
/// classification flags.
pub struct Failure<T> {
    pub input_data: T,
    pub timestamp: SystemTime,
    pub duration: Duration,
    pub err: ErrorCause,
    pub path: Vec<String>,
    pub timeout: bool,
    pub canceled: bool,
}

impl<T> Failure<T> {
    /// Builds a fresh failure with a single-element path.
    pub fn new(name: impl Into<String>, input_data: T, err: ErrorCause, duration: Duration) -> Self {
        Self {
            input_data,
            timestamp: SystemTime::now(),
            duration,
            err,
            path: vec![name.into()],
            timeout: false,
            canceled: false,
        }
    }

    /// Marks this failure as a deadline expiry.
    pub fn with_timeout_flag(mut self) -> Self {
        self.timeout = true;
        self
    }

    /// Marks this failure as an explicit cancellation.
    pub fn with_canceled_flag(mut self) -> Self {
        self.canceled = true;
        self
    }

    /// Prepends `name` to the execution path. Every connector calls this
    /// exactly once on a child's failure before returning it further up.
    pub fn push_front_path(&mut self, name: impl Into<String>) {
        self.path.insert(0, name.into());
    }

    /// Underlying error, for predicate matching via `Unwrap()`-style access.
    pub fn unwrap_err(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.err.as_ref()
    }

    pub fn is_timeout(&self) -> bool {
        self.timeout
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    fn verb(&self) -> &'static str {
        if self.timeout {
            "timed out"
        } else if self.canceled {
            "canceled"
        } else {
            "failed"
        }
    }

    /// Maps the carried input and rewraps, preserving path/timing/flags.
    /// Useful for connectors that wrap an inner `Failure<U>` but expose an
    /// outer `Failure<T>`.
    pub fn map_input<U>(self, f: impl FnOnce(T) -> U) -> Failure<U> {
        Failure {
            input_data: f(self.input_data),
            timestamp: self.timestamp,
            duration: self.duration,
            err: self.err,
            path: self.path,
            timeout: self.timeout,
            canceled: self.canceled,
        }
    }
}

impl<T> fmt::Display for Failure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} after {:?}: {}",
            self.path.join(" -> "),
            self.verb(),
            self.duration,
            self.err
        )
    }
}

impl<T> fmt::Debug for Failure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("path", &self.path)
            .field("duration", &self.duration)
            .field("timeout", &self.timeout)
            .field("canceled", &self.canceled)
            .field("err", &self.err.to_string())
            .finish()
    }
}

impl<T> std::error::Error for Failure<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.err.as_ref())
    }
}

/// Stable error codes for the engine's own structural failures, so
/// programmatic callers and log pipelines can match on a code instead of
/// parsing `Display` strings. Purely additive: the connector semantics in
/// connectors are unaffected by these codes existing.
pub mod codes {
    pub const EMPTY_SEQUENCE: &str = "sequence.empty";
    pub const NAME_NOT_FOUND: &str = "sequence.name_not_found";
    pub const EMPTY_FALLBACK: &str = "fallback.empty";
    pub const FALLBACK_LAST_REMAINING: &str = "fallback.last_remaining";
    pub const EMPTY_FANOUT: &str = "fanout.empty";
    pub const CONTEST_NO_MATCH: &str = "contest.no_match";
    pub const CONTEST_ALL_FAILED: &str = "contest.all_failed";
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limiter.exceeded";
    pub const RATE_LIMITER_UNKNOWN_MODE: &str = "rate_limiter.unknown_mode";
    pub const PANIC: &str = "internal.panic";
}

/// Aggregates the underlying errors from closing a composite connector's
/// children. Empty means every child closed cleanly.
#[derive(Debug, Default)]
pub struct CloseErrors(pub Vec<ErrorCause>);

impl CloseErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Folds a child's close result in, preserving every underlying error
    /// rather than short-circuiting on the first one.
    pub fn absorb(&mut self, result: Result<(), CloseErrors>) {
        if let Err(mut errors) = result {
            self.0.append(&mut errors.0);
        }
    }

    pub fn into_result(self) -> Result<(), CloseErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) while closing: ", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseErrors {}

/// A simple string-backed error, used to wrap the sanitized panic message
/// and other structural failures that don't need a richer error type.
#[derive(Debug, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct CodedError {
    pub code: &'static str,
    pub message: String,
}

impl CodedError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn boxed(code: &'static str, message: impl Into<String>) -> ErrorCause {
        Box::new(Self::new(code, message))
    }
}
