//! Transfer of a call across the thread boundary.
//!
//! A call is turned into an [`ExecutionRequest`] on the calling thread: the invocation identity
//! plus the arguments as structured data. The spawned thread hands the request to [`execute`],
//! the fixed worker entry point, which decodes the arguments, invokes the work function and
//! normalizes however it completed into a single [`Outcome`].

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{select, BoxFuture, Either};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::runtime::CancellationToken;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of one invocation: the task name and a process-unique sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    name: Arc<str>,
    seq: u64,
}

impl TaskId {
    /// Allocate the identity for a new invocation of the task called `name`.
    pub(crate) fn next(name: impl Into<Arc<str>>) -> Self {
        TaskId {
            name: name.into(),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Name of the wrapped task.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequence number, unique within the process and increasing with every invocation.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.seq)
    }
}

/// Self-contained description of one call, moved into the worker thread.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    id: TaskId,
    args: serde_json::Value,
}

impl ExecutionRequest {
    /// Encode `args` for the invocation `id`.
    ///
    /// Fails with [`Error::Serialization`] if the arguments cannot be represented as data, for
    /// instance a map with non-string keys or a failing custom `Serialize` impl.
    pub fn new<A: Serialize>(id: TaskId, args: &A) -> Result<Self, Error> {
        let args = serde_json::to_value(args)
            .map_err(|err| Error::Serialization(format!("{id}: {err}")))?;
        Ok(ExecutionRequest { id, args })
    }

    /// Invocation this request belongs to.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Encoded arguments.
    pub fn args(&self) -> &serde_json::Value {
        &self.args
    }

    /// Reconstruct the arguments on the worker side.
    pub fn decode<A: DeserializeOwned>(self) -> Result<A, String> {
        let ExecutionRequest { id, args } = self;
        serde_json::from_value(args).map_err(|err| format!("{id}: failed to decode arguments: {err}"))
    }
}

/// How a work function returned, before the completion handler normalizes it.
pub enum Completion<T> {
    /// Plain return value.
    Value(T),
    /// Error-like return, already rendered.
    Error(String),
    /// Awaitable that still has to be driven to completion.
    Awaitable(BoxFuture<'static, Result<T, String>>),
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Value(_) => f.write_str("Value(..)"),
            Completion::Error(err) => f.debug_tuple("Error").field(err).finish(),
            Completion::Awaitable(_) => f.write_str("Awaitable(..)"),
        }
    }
}

/// Terminal message of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Success(T),
    Failure(String),
}

impl<T> Outcome<T> {
    /// Convert into the value a [`crate::TaskFuture`] resolves to.
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(message) => Err(Error::Worker(message)),
        }
    }
}

/// Type-erased work function as stored by a [`crate::WrappedTask`].
pub(crate) type Job<A, T> = dyn Fn(A) -> Completion<T> + Send + Sync;

/// Worker entry point. Runs `request` against `job` on the current thread.
///
/// Returns `None` only if the invocation was cancelled while its awaitable was pending. The
/// future has then already been settled (timeout, explicit cancel) or abandoned (dropped).
pub(crate) fn execute<A, T>(
    job: &Job<A, T>,
    request: ExecutionRequest,
    token: &CancellationToken,
) -> Option<Outcome<T>>
where
    A: DeserializeOwned,
{
    let args = match request.decode::<A>() {
        Ok(args) => args,
        Err(message) => return Some(Outcome::Failure(message)),
    };
    match catch_unwind(AssertUnwindSafe(|| job(args))) {
        Ok(completion) => complete(completion, token),
        Err(payload) => Some(Outcome::Failure(panic_message(payload))),
    }
}

/// Completion handler: turns a [`Completion`] into exactly one [`Outcome`].
fn complete<T>(completion: Completion<T>, token: &CancellationToken) -> Option<Outcome<T>> {
    match completion {
        Completion::Value(value) => Some(Outcome::Success(value)),
        Completion::Error(message) => Some(Outcome::Failure(message)),
        Completion::Awaitable(awaitable) => {
            let awaitable = AssertUnwindSafe(awaitable).catch_unwind();
            let cancelled = token.cancelled();
            futures::pin_mut!(cancelled);
            match futures::executor::block_on(select(awaitable, cancelled)) {
                Either::Left((Ok(Ok(value)), _)) => Some(Outcome::Success(value)),
                Either::Left((Ok(Err(message)), _)) => Some(Outcome::Failure(message)),
                Either::Left((Err(payload), _)) => Some(Outcome::Failure(panic_message(payload))),
                // The awaitable is dropped here, together with everything it was waiting on.
                Either::Right(((), _)) => None,
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("worker panicked: {message}")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn job<A, T>(f: impl Fn(A) -> Completion<T> + Send + Sync + 'static) -> Arc<Job<A, T>> {
        Arc::new(f)
    }

    fn request<A: Serialize>(args: &A) -> ExecutionRequest {
        ExecutionRequest::new(TaskId::next("serializer"), args).unwrap()
    }

    #[test]
    fn test_task_id_is_unique() {
        let first = TaskId::next("a");
        let second = TaskId::next("a");
        assert_ne!(first, second);
        assert!(second.seq() > first.seq());
        assert_eq!(first.to_string(), format!("a#{}", first.seq()));
    }

    #[test]
    fn test_request_carries_structured_args() {
        let request = request(&(3, "four", [5.0, 6.5]));
        assert_eq!(request.args(), &serde_json::json!([3, "four", [5.0, 6.5]]));
        let (a, b, c): (i32, String, Vec<f64>) = request.decode().unwrap();
        assert_eq!((a, b.as_str(), c), (3, "four", vec![5.0, 6.5]));
    }

    #[test]
    fn test_request_rejects_unrepresentable_args() {
        let mut args = HashMap::new();
        args.insert((1, 2), "tuple keys are not valid map keys");
        let result = ExecutionRequest::new(TaskId::next("bad"), &args);
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_decode_mismatch_is_a_failure() {
        let job = job(|(a, b): (i32, i32)| Completion::Value(a + b));
        let token = CancellationToken::new();
        let outcome = execute(&*job, request(&"not a pair"), &token);
        match outcome {
            Some(Outcome::Failure(message)) => assert!(message.contains("failed to decode arguments")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_value() {
        let job = job(|(a, b): (i32, i32)| Completion::Value(a + b));
        let token = CancellationToken::new();
        assert_eq!(execute(&*job, request(&(3, 4)), &token), Some(Outcome::Success(7)));
    }

    #[test]
    fn test_error() {
        let job = job(|(): ()| Completion::<()>::Error("bad input".to_string()));
        let token = CancellationToken::new();
        assert_eq!(
            execute(&*job, request(&()), &token),
            Some(Outcome::Failure("bad input".to_string()))
        );
    }

    #[test]
    fn test_panic() {
        let job = job(|(): ()| -> Completion<()> { panic!("boom") });
        let token = CancellationToken::new();
        assert_eq!(
            execute(&*job, request(&()), &token),
            Some(Outcome::Failure("worker panicked: boom".to_string()))
        );
    }

    #[test]
    fn test_awaitable_resolves_and_rejects() {
        let job = job(|ok: bool| {
            Completion::Awaitable(
                async move {
                    if ok {
                        Ok("done")
                    } else {
                        Err("nope".to_string())
                    }
                }
                .boxed(),
            )
        });
        let token = CancellationToken::new();
        assert_eq!(execute(&*job, request(&true), &token), Some(Outcome::Success("done")));
        assert_eq!(
            execute(&*job, request(&false), &token),
            Some(Outcome::Failure("nope".to_string()))
        );
    }

    async fn explode() -> Result<(), String> {
        panic!("async boom")
    }

    #[test]
    fn test_awaitable_panic() {
        let job = job(|(): ()| Completion::Awaitable(explode().boxed()));
        let token = CancellationToken::new();
        assert_eq!(
            execute(&*job, request(&()), &token),
            Some(Outcome::Failure("worker panicked: async boom".to_string()))
        );
    }

    #[test]
    fn test_cancelled_awaitable_produces_no_outcome() {
        let job = job(|(): ()| {
            Completion::Awaitable(futures::future::pending::<Result<(), String>>().boxed())
        });
        let token = CancellationToken::new();
        std::thread::spawn({
            let token = token.clone();
            move || {
                std::thread::sleep(Duration::from_millis(10));
                token.cancel();
            }
        });
        assert_eq!(execute(&*job, request(&()), &token), None);
    }
}
