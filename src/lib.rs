//! Run sync and async functions on dedicated worker threads and await their result.
//!
//! [`wrap`] turns a function into a [`WrappedTask`]. Each [`WrappedTask::call`] spawns a fresh
//! worker thread, moves the serialized arguments over, and returns a [`TaskFuture`] that settles
//! exactly once with the function's result, its error, or a timeout.
//!
//! ```
//! # use std::time::Duration;
//! # tokio_test::block_on(async {
//! let slow = async_worker::wrap(|ms: u64| {
//!     std::thread::sleep(Duration::from_millis(ms));
//!     "done"
//! })
//! .with_timeout(Duration::from_millis(1_000));
//!
//! assert_eq!(slow.call(10).await, Ok("done"));
//! # })
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod runtime;
pub mod serializer;

pub use bridge::{wrap, wrap_async, wrap_fallible, WrappedTask};
pub use config::Config;
pub use error::Error;
pub use runtime::{is_cancelled, CancellationToken, TaskFuture};
pub use serializer::{ExecutionRequest, Outcome, TaskId};
