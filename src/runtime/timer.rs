use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::runtime::future::Expire;
use crate::runtime::thread_local::TimerThreadLocal;
use crate::serializer::TaskId;

/// Refers to the global deadline timer. The timer is responsible for rejecting futures whose
/// deadline elapsed before their worker reported an outcome, on a single dedicated thread.
///
/// Note that this object should not be used by callers because each thread gets its own delegate
/// object to communicate with the timer.
///
/// # Usage
///
/// Each thread should get its own [`TimerThreadLocal`] object, which acts as delegate object.
///
/// Use `Timer::thread_local` to get the thread local object:
///
/// ```ignore
/// let timer = TIMER.lock().unwrap().as_ref().map(Timer::thread_local);
/// ```
///
/// Holds the spawn error instead if the timer thread could not be started. Every deadline armed
/// afterwards is then rejected with [`Error::Runtime`].
pub(super) static TIMER: Lazy<Mutex<Result<Timer, Error>>> =
    Lazy::new(|| Mutex::new(Timer::new()));

/// Deadline registered for one invocation.
pub(crate) struct Deadline {
    /// Point in time at which the invocation times out.
    at: Instant,
    /// Configured timeout, reported in the error.
    after: Duration,
    /// Invocation to expire. Dead once both the future and the worker are gone.
    target: Weak<dyn Expire>,
    /// Token to trigger once the deadline fires.
    token: CancellationToken,
    id: TaskId,
}

impl Deadline {
    /// Create a deadline that fires `after` has elapsed since `started`.
    ///
    /// Returns `None` if that point in time cannot be represented. Such a deadline would never
    /// fire, so there is nothing to arm.
    pub(crate) fn new(
        id: TaskId,
        started: Instant,
        after: Duration,
        target: Weak<dyn Expire>,
        token: CancellationToken,
    ) -> Option<Self> {
        Some(Deadline {
            at: started.checked_add(after)?,
            after,
            target,
            token,
            id,
        })
    }

    /// Whether firing this deadline would still have an effect.
    fn is_live(&self) -> bool {
        self.target
            .upgrade()
            .map(|target| !target.is_settled())
            .unwrap_or(false)
    }

    /// Expire the invocation and cancel its worker, unless it already settled.
    fn fire(self) {
        if let Some(target) = self.target.upgrade() {
            if target.expire(self.after) {
                tracing::debug!(task = %self.id, timeout = ?self.after, "deadline elapsed, cancelling worker");
                self.token.cancel();
            }
        }
    }
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.id.seq().cmp(&other.id.seq()))
    }
}

/// Message sent to the timer thread.
pub(crate) enum Message {
    /// Register a deadline.
    Arm(Deadline),
    /// Wake the loop so it observes the run flag. Only sent by [`Timer`]'s `Drop`.
    Wake,
}

/// Timer object that holds the timer thread and a channel to send deadlines to it.
///
/// The global [`TIMER`] lives for the whole process and is never dropped, so its thread only
/// stops when the process exits. Dropping a [`Timer`] stops and joins its thread, which applies to
/// timers created on their own.
pub struct Timer {
    join_handle: Option<std::thread::JoinHandle<()>>,
    run_flag: Arc<AtomicBool>,
    message_tx: Sender<Message>,
}

impl Timer {
    /// Acquire a thread local delegate for the timer.
    pub(super) fn thread_local(&self) -> TimerThreadLocal {
        TimerThreadLocal::from_sender(self.message_tx.clone())
    }

    /// Create timer.
    fn new() -> Result<Self, Error> {
        Self::spawn(std::thread::Builder::new().name("async-worker-timer".to_string()))
    }

    /// Start the timer thread with `builder`.
    fn spawn(builder: std::thread::Builder) -> Result<Self, Error> {
        let run_flag = Arc::new(AtomicBool::new(true));
        let (message_tx, message_rx) = channel::<Message>();

        let join_handle = builder
            .spawn({
                let run_flag = run_flag.clone();
                move || Self::worker(run_flag, message_rx)
            })
            .map_err(|err| {
                tracing::error!(%err, "failed to spawn deadline timer thread");
                Error::Runtime
            })?;

        Ok(Timer {
            join_handle: Some(join_handle),
            run_flag,
            message_tx,
        })
    }

    /// Timer loop. Waits for the earliest pending deadline or a new message, whichever comes
    /// first, until [`run_flag`] becomes `false`.
    ///
    /// # Arguments
    ///
    /// * `run_flag` - Atomic flag that indicates whether the timer should continue running.
    /// * `message_rx` - Receives deadlines to track.
    fn worker(run_flag: Arc<AtomicBool>, message_rx: Receiver<Message>) {
        let mut deadlines: BinaryHeap<Reverse<Deadline>> = BinaryHeap::new();
        while run_flag.load(Ordering::Relaxed) {
            let now = Instant::now();
            while deadlines
                .peek()
                .map(|Reverse(deadline)| deadline.at <= now)
                .unwrap_or(false)
            {
                if let Some(Reverse(deadline)) = deadlines.pop() {
                    deadline.fire();
                }
            }

            let received = match deadlines.peek() {
                Some(Reverse(next)) => message_rx.recv_timeout(next.at.saturating_duration_since(now)),
                None => message_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(Message::Arm(deadline)) => {
                    if deadline.is_live() {
                        deadlines.push(Reverse(deadline));
                    }
                }
                Ok(Message::Wake) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            // Invocations that settled on their own leave dead entries behind. Drop them once they
            // make up most of the heap.
            if deadlines.len() > 64 {
                let live = deadlines.iter().filter(|Reverse(d)| d.is_live()).count();
                if live * 2 < deadlines.len() {
                    deadlines.retain(|Reverse(d)| d.is_live());
                }
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.run_flag.store(false, Ordering::Relaxed);

        // Wake the loop so it encounters the `run_flag` that is now false, then stops. If this
        // fails the channel is broken, which means the thread already quit and joins immediately.
        let _ = self.message_tx.send(Message::Wake);

        if let Some(join_handle) = self.join_handle.take() {
            join_handle.join().expect("failed to join on timer thread");
        }
    }
}
