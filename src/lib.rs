//! A composable, type-parameterized pipeline engine.
//!
//! Every component — leaf adapter or connector — satisfies one contract:
//! given a [`Context`] and a value of type `T`, produce either an output
//! value of type `T` or a structured [`Failure<T>`]. Connectors are
//! themselves [`Processor`]s, so arbitrary strategies nest freely:
//! a [`connectors::Retry`] can wrap a [`connectors::Sequence`] that itself
//! branches through a [`connectors::Switch`].
//!
//! ```
//! use std::sync::Arc;
//! use spark_flow::{Context, Processor};
//! use spark_flow::adapters::Transform;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let doubler = Transform::new("double", |_ctx: &Context, v: &i32| {
//!     let v = *v;
//!     async move { v * 2 }
//! });
//! let out = doubler.process(&Context::background(), 21).await.unwrap();
//! assert_eq!(out, 42);
//! # }
//! ```

pub mod adapters;
pub mod clock;
pub mod connectors;
pub mod context;
pub mod error;
pub mod observability;
pub mod panic;
pub mod processor;

pub use clock::{Clock, SystemClock, TestClock};
pub use context::{Context, DoneReason};
pub use error::{CloseErrors, CodedError, ErrorCause, Failure};
pub use processor::Processor;
