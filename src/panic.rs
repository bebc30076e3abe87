//! Panic-to-failure conversion shared by every adapter and connector.
//!
//! # Why
//! A panic anywhere in user code must never escape a `Process` call and
//! crash the caller's task. Two capture mechanisms are needed depending on
//! where the panicking code runs:
//! - inline on the caller's task (adapters, Sequence/Switch/Fallback/Retry/
//!   Backoff/Handle/RateLimiter children) — caught with
//!   `futures::FutureExt::catch_unwind`;
//! - on a spawned task (Timeout/Concurrent/Race/Contest children) — caught
//!   via `JoinHandle`'s `JoinError::is_panic`, since a panic inside
//!   `tokio::spawn` already unwinds that task in isolation.
//!
//! Both paths funnel into [`sanitize_panic_message`] before the message is
//! placed in a [`crate::error::Failure`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{CodedError, ErrorCause};
use crate::error::codes;

const MAX_PANIC_MESSAGE_LEN: usize = 512;
const REDACTION_PLACEHOLDER: &str = "<redacted>";
const FRAME_PLACEHOLDER: &str = "<frame>";

fn address_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap())
}

fn path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:/[\w.\-]+)+\.rs|[A-Za-z]:\\[^\s:]+").unwrap())
}

fn frame_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(?:at |\d+:\s*0x).*$").unwrap())
}

/// Extracts a human-readable message from a panic payload and strips memory
/// addresses, absolute file paths, and stack-frame fragments, then truncates
/// to a fixed bound.
pub fn sanitize_panic_message(payload: &(dyn Any + Send)) -> String {
    let raw = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };

    let redacted = address_pattern().replace_all(&raw, REDACTION_PLACEHOLDER);
    let redacted = path_pattern().replace_all(&redacted, REDACTION_PLACEHOLDER);
    let redacted = frame_pattern().replace_all(&redacted, FRAME_PLACEHOLDER);

    let mut truncated = redacted.into_owned();
    if truncated.len() > MAX_PANIC_MESSAGE_LEN {
        truncated.truncate(MAX_PANIC_MESSAGE_LEN);
        truncated.push_str("...");
    }
    truncated
}

/// Builds the [`ErrorCause`] for a recovered panic.
pub fn panic_error(payload: &(dyn Any + Send)) -> ErrorCause {
    CodedError::boxed(codes::PANIC, sanitize_panic_message(payload))
}

/// Runs `fut` under panic recovery, returning `Err(ErrorCause)` with a
/// sanitized message if it panics instead of letting the unwind propagate.
pub async fn guard<F, Out>(fut: F) -> Result<Out, ErrorCause>
where
    F: Future<Output = Out>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => Err(panic_error(payload.as_ref())),
    }
}

/// Converts a `tokio::task::JoinError` from a spawned child task into an
/// [`ErrorCause`], sanitizing the panic message if the task panicked.
pub fn join_error_to_cause(err: tokio::task::JoinError) -> ErrorCause {
    if err.is_panic() {
        let payload = err.into_panic();
        panic_error(payload.as_ref())
    } else {
        CodedError::boxed(codes::PANIC, "task was canceled before completion")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_addresses_and_paths() {
        let msg = "boom at 0xDEADBEEF in /home/user/project/src/lib.rs:42";
        let payload: Box<dyn Any + Send> = Box::new(msg.to_string());
        let sanitized = sanitize_panic_message(payload.as_ref());
        assert!(!sanitized.contains("0xDEADBEEF"));
        assert!(!sanitized.contains("/home/user"));
        assert!(regex::Regex::new(r"0x[0-9a-f]+").unwrap().find(&sanitized).is_none());
    }

    #[test]
    fn truncates_long_messages() {
        let long = "x".repeat(1000);
        let payload: Box<dyn Any + Send> = Box::new(long);
        let sanitized = sanitize_panic_message(payload.as_ref());
        assert!(sanitized.len() <= MAX_PANIC_MESSAGE_LEN + 3);
    }

    #[tokio::test]
    async fn guard_converts_panic_to_error() {
        let result = guard(async { panic!("kaboom") }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn guard_passes_through_success() {
        let result = guard(async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
