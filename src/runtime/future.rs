use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::serializer::{Outcome, TaskId};

type Result<T> = std::result::Result<T, Error>;

/// Future for a single invocation of a [`crate::WrappedTask`].
///
/// The future is settled exactly once, by whichever happens first:
///
/// * the worker thread reports an [`Outcome`],
/// * the deadline timer fires,
/// * the invocation is cancelled with [`TaskFuture::cancel`].
///
/// Every later settlement attempt is ignored.
///
/// # Dedicated-thread semantics
///
/// The work itself runs on its own OS thread, which is spawned when the invocation is made and
/// not when the future is first polled. The future does not depend on any particular async
/// runtime and can be awaited from any executor.
///
/// # Cancellation
///
/// Dropping a future that has not settled yet cancels the worker. Async work is dropped at its
/// next await point. Sync work keeps running unless it checks [`crate::is_cancelled`].
///
/// # Usage
///
/// ```
/// # tokio_test::block_on(async {
/// let double = async_worker::wrap(|x: u32| x * 2);
/// assert_eq!(double.call(21).await, Ok(42));
/// # })
/// ```
pub struct TaskFuture<T> {
    slot: Arc<Slot<T>>,
    token: CancellationToken,
}

impl<T> TaskFuture<T> {
    /// Create a pending future along with the handle through which it will be settled.
    pub(crate) fn pending(id: TaskId) -> (Self, Settlement<T>) {
        let slot = Arc::new(Slot::new(id));
        let token = CancellationToken::new();
        let settlement = Settlement {
            slot: slot.clone(),
            token: token.clone(),
        };
        (Self { slot, token }, settlement)
    }

    /// Create a future that is already rejected. No worker is associated with it.
    pub(crate) fn rejected(id: TaskId, error: Error) -> Self {
        let (future, settlement) = Self::pending(id);
        settlement.settle(Err(error));
        future
    }

    /// Identity of the invocation this future belongs to.
    pub fn id(&self) -> &TaskId {
        &self.slot.id
    }

    /// Whether the future has been settled. Awaiting a settled future completes immediately.
    pub fn is_settled(&self) -> bool {
        !matches!(self.slot.lock().state, State::Pending)
    }

    /// Reject the future with [`Error::Cancelled`] and ask the worker to stop.
    ///
    /// Has no effect on a future that has already settled.
    pub fn cancel(&self) {
        if self.slot.settle(Err(Error::Cancelled)) {
            self.token.cancel();
        }
    }
}

impl<T> std::future::Future for TaskFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let mut shared = self.slot.lock();
        match shared.state {
            // Still waiting for the worker or the timer. Replace the waker since the future may
            // have moved to another task since the last poll.
            State::Pending => {
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            // The future was settled and a result is available. We take out the result and change
            // the state from `Settled` to `Done`.
            State::Settled => match shared.result.take() {
                Some(result) => {
                    shared.done();
                    Poll::Ready(result)
                }
                None => panic!("settled without result"),
            },
            // It is illegal to poll a future after it has become ready before.
            State::Done => {
                panic!("future polled after completion");
            }
        }
    }
}

impl<T> Drop for TaskFuture<T> {
    fn drop(&mut self) {
        let pending = matches!(self.slot.lock().state, State::Pending);
        if pending {
            tracing::trace!(task = %self.slot.id, "future dropped before settlement, cancelling worker");
            self.token.cancel();
        }
    }
}

impl<T> std::fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("id", &self.slot.id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Handle through which a [`TaskFuture`] is settled. Cloned into the worker and the deadline
/// timer; only the first call to [`Settlement::settle`] has an effect.
pub(crate) struct Settlement<T> {
    slot: Arc<Slot<T>>,
    token: CancellationToken,
}

impl<T> Clone for Settlement<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T> Settlement<T> {
    /// Settle the future. Returns `false` if it was already settled.
    pub(crate) fn settle(&self, result: Result<T>) -> bool {
        self.slot.settle(result)
    }

    /// Cancellation token of the invocation.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Turn the handle into a [`Completer`]. Must only be done on the worker thread, once the
    /// thread is actually running.
    pub(crate) fn into_completer(self) -> Completer<T> {
        Completer(Some(self))
    }
}

impl<T: Send + 'static> Settlement<T> {
    /// Weak reference the deadline timer can expire without keeping the slot alive.
    pub(crate) fn expiry(&self) -> std::sync::Weak<dyn Expire> {
        let slot: Arc<dyn Expire> = self.slot.clone();
        Arc::downgrade(&slot)
    }
}

/// Sending half of the result channel, owned by the worker thread.
///
/// Consumed by [`Completer::complete`], so a worker can report at most once. If it is dropped
/// without reporting, for instance because the worker thread unwinds, the future is rejected with
/// [`Error::WorkerLost`] instead of waiting forever.
pub(crate) struct Completer<T>(Option<Settlement<T>>);

impl<T> Completer<T> {
    /// Report the worker's outcome.
    pub(crate) fn complete(mut self, outcome: Outcome<T>) {
        if let Some(settlement) = self.0.take() {
            settlement.settle(outcome.into_result());
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(settlement) = self.0.take() {
            settlement.settle(Err(Error::WorkerLost));
        }
    }
}

/// Expiry hook used by the deadline timer.
pub(crate) trait Expire: Send + Sync {
    /// Reject with [`Error::Timeout`]. Returns `false` if the future was already settled.
    fn expire(&self, after: Duration) -> bool;

    /// Whether the future was already settled.
    fn is_settled(&self) -> bool;
}

/// Settlement slot shared between the future and every party that can settle it.
struct Slot<T> {
    id: TaskId,
    shared: Mutex<Shared<T>>,
}

impl<T> Slot<T> {
    fn new(id: TaskId) -> Self {
        Self {
            id,
            shared: Mutex::new(Shared::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        // A poisoned lock still holds a consistent state: every transition is a single write.
        match self.shared.lock() {
            Ok(shared) => shared,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn settle(&self, result: Result<T>) -> bool {
        let waker = {
            let mut shared = self.lock();
            if !matches!(shared.state, State::Pending) {
                tracing::trace!(task = %self.id, "ignoring late settlement");
                return false;
            }
            tracing::debug!(task = %self.id, ok = result.is_ok(), "settled");
            shared.settle(result);
            shared.waker.take()
        };
        // If the future is being awaited, this causes the executor to poll it again. Since the
        // state is now `State::Settled`, the future will return a result.
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }
}

impl<T: Send> Expire for Slot<T> {
    fn expire(&self, after: Duration) -> bool {
        self.settle(Err(Error::Timeout(after)))
    }

    fn is_settled(&self) -> bool {
        !matches!(self.lock().state, State::Pending)
    }
}

/// State behind the slot's lock.
struct Shared<T> {
    /// Current future state.
    state: State,
    /// Waker that can be used to wake the future.
    waker: Option<Waker>,
    /// Result of the invocation.
    result: Option<Result<T>>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum State {
    /// No outcome yet.
    Pending,
    /// Settled and a result is available.
    Settled,
    /// Result has been taken out.
    Done,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Shared {
            state: State::Pending,
            waker: None,
            result: None,
        }
    }

    #[inline]
    fn settle(&mut self, result: Result<T>) {
        self.result = Some(result);
        self.state = State::Settled;
    }

    #[inline]
    fn done(&mut self) {
        self.state = State::Done;
    }
}
