mod future;
mod thread_local;
mod timer;
mod work;

pub use future::TaskFuture;
pub use thread_local::is_cancelled;

pub(crate) use future::Settlement;
pub(crate) use thread_local::{arm, enter};
pub(crate) use timer::Deadline;
pub(crate) use work::Work;

/// Cancellation token shared between a [`TaskFuture`] and its worker thread.
///
/// Async work observes it at every await point, sync work through [`is_cancelled`].
pub use tokio_util::sync::CancellationToken;
