//! Leaf adapters that turn plain user functions into [`Processor`]s
//! from ordinary closures.
//!
//! Every adapter borrows the value (`&T`) when invoking the user function
//! rather than consuming it, so the adapter always still owns `value` itself
//! on the panic and plain-error paths — satisfying invariant 2 ("a failed
//! `Process` returns some value... the unchanged input") without requiring
//! `T: Clone` on every leaf.

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{ErrorCause, Failure};
use crate::panic::guard;
use crate::processor::Processor;

/// If `cause` is already a structured [`Failure<T>`] (e.g. the user function
/// invoked another pipeline), downcast and return it untouched; otherwise
/// wrap it in a fresh one rooted at `name`.
fn into_failure<T: Send + Sync + 'static>(
    name: &str,
    value: T,
    cause: ErrorCause,
    elapsed: std::time::Duration,
) -> Failure<T> {
    match cause.downcast::<Failure<T>>() {
        Ok(already_structured) => *already_structured,
        Err(cause) => Failure::new(name.to_string(), value, cause, elapsed),
    }
}

/// `f(ctx, T) -> T`; cannot fail except by panicking.
pub struct Transform<T, F, Fut>
where
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    name: String,
    f: F,
    _marker: std::marker::PhantomData<fn(&T)>,
}

impl<T, F, Fut> Transform<T, F, Fut>
where
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Processor<T> for Transform<T, F, Fut>
where
    T: Send + Sync + 'static,
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let start = Instant::now();
        match guard((self.f)(ctx, &value)).await {
            Ok(new_value) => Ok(new_value),
            Err(panic_cause) => Err(Failure::new(self.name.clone(), value, panic_cause, start.elapsed())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// `f(ctx, T) -> (T, err)`; may fail.
pub struct Apply<T, F, Fut>
where
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ErrorCause>> + Send + 'static,
{
    name: String,
    f: F,
    _marker: std::marker::PhantomData<fn(&T)>,
}

impl<T, F, Fut> Apply<T, F, Fut>
where
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ErrorCause>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Processor<T> for Apply<T, F, Fut>
where
    T: Send + Sync + 'static,
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ErrorCause>> + Send + 'static,
{
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let start = Instant::now();
        match guard((self.f)(ctx, &value)).await {
            Ok(Ok(new_value)) => Ok(new_value),
            Ok(Err(cause)) => Err(into_failure(&self.name, value, cause, start.elapsed())),
            Err(panic_cause) => Err(Failure::new(self.name.clone(), value, panic_cause, start.elapsed())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// `f(ctx, T) -> err`; produces only a side effect. The input passes through
/// unchanged on success.
pub struct Effect<T, F, Fut>
where
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ErrorCause>> + Send + 'static,
{
    name: String,
    f: F,
    _marker: std::marker::PhantomData<fn(&T)>,
}

impl<T, F, Fut> Effect<T, F, Fut>
where
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ErrorCause>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Processor<T> for Effect<T, F, Fut>
where
    T: Send + Sync + 'static,
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ErrorCause>> + Send + 'static,
{
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let start = Instant::now();
        match guard((self.f)(ctx, &value)).await {
            Ok(Ok(())) => Ok(value),
            Ok(Err(cause)) => Err(into_failure(&self.name, value, cause, start.elapsed())),
            Err(panic_cause) => Err(Failure::new(self.name.clone(), value, panic_cause, start.elapsed())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// `(condition(ctx,T) -> bool, transform(ctx,T) -> T)`; conditionally
/// replaces the value. Never produces an error except via panic.
pub struct Mutate<T, C, CFut, X, XFut>
where
    C: Fn(&Context, &T) -> CFut + Send + Sync + 'static,
    CFut: Future<Output = bool> + Send + 'static,
    X: Fn(&Context, &T) -> XFut + Send + Sync + 'static,
    XFut: Future<Output = T> + Send + 'static,
{
    name: String,
    cond: C,
    xform: X,
    _marker: std::marker::PhantomData<fn(&T)>,
}

impl<T, C, CFut, X, XFut> Mutate<T, C, CFut, X, XFut>
where
    C: Fn(&Context, &T) -> CFut + Send + Sync + 'static,
    CFut: Future<Output = bool> + Send + 'static,
    X: Fn(&Context, &T) -> XFut + Send + Sync + 'static,
    XFut: Future<Output = T> + Send + 'static,
{
    pub fn new(name: impl Into<String>, cond: C, xform: X) -> Self {
        Self {
            name: name.into(),
            cond,
            xform,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, C, CFut, X, XFut> Processor<T> for Mutate<T, C, CFut, X, XFut>
where
    T: Send + Sync + 'static,
    C: Fn(&Context, &T) -> CFut + Send + Sync + 'static,
    CFut: Future<Output = bool> + Send + 'static,
    X: Fn(&Context, &T) -> XFut + Send + Sync + 'static,
    XFut: Future<Output = T> + Send + 'static,
{
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let start = Instant::now();
        match guard((self.cond)(ctx, &value)).await {
            Ok(true) => match guard((self.xform)(ctx, &value)).await {
                Ok(new_value) => Ok(new_value),
                Err(panic_cause) => {
                    Err(Failure::new(self.name.clone(), value, panic_cause, start.elapsed()))
                }
            },
            Ok(false) => Ok(value),
            Err(panic_cause) => Err(Failure::new(self.name.clone(), value, panic_cause, start.elapsed())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Best-effort augmentation: on failure, the original value is returned with
/// no error surfaced.
pub struct Enrich<T, F, Fut>
where
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ErrorCause>> + Send + 'static,
{
    name: String,
    f: F,
    _marker: std::marker::PhantomData<fn(&T)>,
}

impl<T, F, Fut> Enrich<T, F, Fut>
where
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ErrorCause>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Processor<T> for Enrich<T, F, Fut>
where
    T: Send + Sync + 'static,
    F: Fn(&Context, &T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ErrorCause>> + Send + 'static,
{
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        let start = Instant::now();
        match guard((self.f)(ctx, &value)).await {
            Ok(Ok(new_value)) => Ok(new_value),
            Ok(Err(_discarded)) => Ok(value),
            Err(panic_cause) => Err(Failure::new(self.name.clone(), value, panic_cause, start.elapsed())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodedError;

    fn ctx() -> Context {
        Context::background()
    }

    #[tokio::test]
    async fn transform_replaces_value() {
        let t = Transform::new("double", |_ctx: &Context, v: &i32| {
            let v = *v;
            async move { v * 2 }
        });
        let out = t.process(&ctx(), 21).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn apply_wraps_plain_error_with_name_path() {
        let a = Apply::new("boom", |_ctx: &Context, _v: &i32| async {
            Err::<i32, ErrorCause>(CodedError::boxed("test.boom", "boom"))
        });
        let err = a.process(&ctx(), 5).await.unwrap_err();
        assert_eq!(err.path, vec!["boom".to_string()]);
        assert_eq!(err.input_data, 5);
    }

    #[tokio::test]
    async fn apply_passes_through_already_structured_failure() {
        let a = Apply::new("outer", |_ctx: &Context, _v: &i32| async {
            let inner: Failure<i32> = Failure::new("inner", 99, CodedError::boxed("x", "y"), std::time::Duration::ZERO);
            Err::<i32, ErrorCause>(Box::new(inner))
        });
        let err = a.process(&ctx(), 5).await.unwrap_err();
        assert_eq!(err.path, vec!["inner".to_string()]);
        assert_eq!(err.input_data, 99);
    }

    #[tokio::test]
    async fn effect_passes_through_on_success() {
        let e = Effect::new("log", |_ctx: &Context, _v: &i32| async { Ok(()) });
        let out = e.process(&ctx(), 7).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn mutate_conditionally_replaces() {
        let m = Mutate::new(
            "bump-if-odd",
            |_ctx: &Context, v: &i32| {
                let odd = v % 2 != 0;
                async move { odd }
            },
            |_ctx: &Context, v: &i32| {
                let v = *v;
                async move { v + 1 }
            },
        );
        assert_eq!(m.process(&ctx(), 3).await.unwrap(), 4);
        assert_eq!(m.process(&ctx(), 4).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn enrich_discards_error_and_keeps_original() {
        let e = Enrich::new("enrich", |_ctx: &Context, _v: &i32| async {
            Err::<i32, ErrorCause>(CodedError::boxed("x", "nope"))
        });
        let out = e.process(&ctx(), 11).await.unwrap();
        assert_eq!(out, 11);
    }

    #[tokio::test]
    async fn transform_panic_becomes_structured_failure() {
        let t = Transform::new("panics", |_ctx: &Context, _v: &i32| async { panic!("nope") });
        let err = t.process(&ctx(), 3).await.unwrap_err();
        assert_eq!(err.path, vec!["panics".to_string()]);
        assert_eq!(err.input_data, 3);
    }
}
