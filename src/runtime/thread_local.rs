use std::cell::RefCell;
use std::sync::mpsc::Sender;
use std::sync::PoisonError;

use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::runtime::timer::{Deadline, Message, Timer, TIMER};

thread_local! {
    /// Thread-local timer delegate.
    ///
    /// This object serves as the per-thread reference to the [`TIMER`] that can be used to
    /// register deadlines on the timer thread. `None` if the timer thread failed to start.
    ///
    /// # Usage
    ///
    /// ```ignore
    /// assert!(
    ///     TIMER_THREAD_LOCAL.with(|timer| arm_on(timer.as_ref(), deadline)).is_ok()
    /// )
    /// ```
    pub(super) static TIMER_THREAD_LOCAL: Lazy<Option<TimerThreadLocal>> = Lazy::new(|| {
        TIMER
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .ok()
            .map(Timer::thread_local)
    });

    /// Cancellation token of the invocation running on this thread, if this is a worker thread.
    static CURRENT_TOKEN: RefCell<Option<CancellationToken>> = const { RefCell::new(None) };
}

/// Per-thread delegate for the global deadline timer.
pub struct TimerThreadLocal(Sender<Message>);

impl TimerThreadLocal {
    /// Initialize [`TimerThreadLocal`] from [`Sender`] that allows the delegate to send deadlines
    /// to the actual [`crate::runtime::timer::Timer`].
    ///
    /// # Arguments
    ///
    /// * `sender` - Sender through which deadlines can be sent to the timer.
    pub(super) fn from_sender(sender: Sender<Message>) -> Self {
        TimerThreadLocal(sender)
    }

    /// Register deadline on timer.
    ///
    /// # Arguments
    ///
    /// * `deadline` - Deadline to track.
    pub(crate) fn arm(&self, deadline: Deadline) -> Result<(), Error> {
        self.0
            .send(Message::Arm(deadline))
            .map_err(|_| Error::Runtime)
    }
}

/// Register a deadline on the global timer through this thread's delegate.
#[inline]
pub(crate) fn arm(deadline: Deadline) -> Result<(), Error> {
    TIMER_THREAD_LOCAL.with(|timer| arm_on(timer.as_ref(), deadline))
}

/// Register a deadline through `delegate`, or fail with [`Error::Runtime`] if there is no timer.
fn arm_on(delegate: Option<&TimerThreadLocal>, deadline: Deadline) -> Result<(), Error> {
    match delegate {
        Some(delegate) => delegate.arm(deadline),
        None => Err(Error::Runtime),
    }
}

/// Guard that keeps a cancellation token bound to the current thread. Restores the previous
/// binding when dropped.
pub(crate) struct TokenGuard(Option<CancellationToken>);

/// Bind `token` to the current thread for as long as the returned guard lives.
pub(crate) fn enter(token: CancellationToken) -> TokenGuard {
    TokenGuard(CURRENT_TOKEN.with(|current| current.replace(Some(token))))
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT_TOKEN.with(|current| *current.borrow_mut() = previous);
    }
}

/// Whether the invocation running on the current worker thread has been cancelled, either
/// because its deadline elapsed or because its future was cancelled or dropped.
///
/// Long-running sync work can poll this to stop early. Always `false` outside of a worker thread.
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// let count = async_worker::wrap(|limit: u64| {
///     let mut n = 0;
///     while n < limit && !async_worker::is_cancelled() {
///         n += 1;
///     }
///     n
/// });
/// assert_eq!(count.call(1_000).await, Ok(1_000));
/// # })
/// ```
pub fn is_cancelled() -> bool {
    CURRENT_TOKEN.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::runtime::future::TaskFuture;
    use crate::serializer::TaskId;

    #[tokio::test]
    async fn test_arm_works() {
        let (future, settlement) = TaskFuture::<()>::pending(TaskId::next("arm"));
        let deadline = Deadline::new(
            future.id().clone(),
            Instant::now(),
            Duration::from_millis(5),
            settlement.expiry(),
            settlement.token().clone(),
        )
        .unwrap();
        assert!(arm(deadline).is_ok());
        assert!(future.await.unwrap_err().is_timeout());
    }

    #[test]
    fn test_arm_without_timer_fails() {
        let (future, settlement) = TaskFuture::<()>::pending(TaskId::next("arm"));
        let deadline = Deadline::new(
            future.id().clone(),
            Instant::now(),
            Duration::from_millis(5),
            settlement.expiry(),
            settlement.token().clone(),
        )
        .unwrap();
        assert_eq!(arm_on(None, deadline), Err(Error::Runtime));
        assert!(!future.is_settled());
    }

    #[test]
    fn test_is_cancelled_follows_bound_token() {
        assert!(!is_cancelled());
        let token = CancellationToken::new();
        {
            let _guard = enter(token.clone());
            assert!(!is_cancelled());
            token.cancel();
            assert!(is_cancelled());
        }
        assert!(!is_cancelled());
    }

    #[test]
    fn test_enter_restores_previous() {
        let outer = CancellationToken::new();
        outer.cancel();
        let _outer_guard = enter(outer);
        {
            let _inner_guard = enter(CancellationToken::new());
            assert!(!is_cancelled());
        }
        assert!(is_cancelled());
    }
}
