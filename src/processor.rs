//! The single uniform capability every leaf adapter and every connector
//! implements: compose by holding `Arc<dyn Processor<T>>` references, never
//! by subclassing. Connectors are themselves processors, so they nest
//! freely to arbitrary depth.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{CloseErrors, Failure};

/// `Process(ctx, T) -> (T, Failure?)`, type-parameterized over the value
/// being transformed so the compiler prevents mixing pipelines of unrelated
/// types. `T` is `Sync` so that a `Failure<T>` can be boxed as
/// `dyn Error + Send + Sync` and downcast back out of nested pipeline calls.
#[async_trait]
pub trait Processor<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Transforms `value`, or fails with a structured [`Failure`] whose path
    /// begins with this processor's own name.
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>>;

    /// Stable name used in debugging and failure paths.
    fn name(&self) -> &str;

    /// Releases any resources this processor holds (event bus subscribers
    /// and the like) and recurses into its children. Callable once or many
    /// times — a second call must be a no-op. Most processors hold nothing
    /// worth releasing, hence the no-op default; composites override this
    /// to close their own event bus and fold in their children's results.
    fn close(&self) -> Result<(), CloseErrors> {
        Ok(())
    }
}

#[async_trait]
impl<T> Processor<T> for Arc<dyn Processor<T>>
where
    T: Send + Sync + 'static,
{
    async fn process(&self, ctx: &Context, value: T) -> Result<T, Failure<T>> {
        self.as_ref().process(ctx, value).await
    }

    fn name(&self) -> &str {
        self.as_ref().name()
    }

    fn close(&self) -> Result<(), CloseErrors> {
        self.as_ref().close()
    }
}
