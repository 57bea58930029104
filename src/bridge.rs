use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;
use crate::runtime::{self, Deadline, Settlement, TaskFuture, Work};
use crate::serializer::{self, Completion, ExecutionRequest, Job, TaskId};

const DEFAULT_NAME: &str = "async-worker";

/// Wrap a function so that every call runs it on a fresh worker thread.
///
/// `A` is the argument type. Use a tuple for several arguments, `()` for none. Arguments cross
/// the thread boundary as data, so they must be serializable.
///
/// The configuration defaults to [`Config::default`], i.e. whatever the environment specifies.
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// let add = async_worker::wrap(|(a, b): (i32, i32)| a + b);
/// assert_eq!(add.call((3, 4)).await, Ok(7));
/// # })
/// ```
pub fn wrap<A, T, F>(f: F) -> WrappedTask<A, T>
where
    F: Fn(A) -> T + Send + Sync + 'static,
    A: Serialize + DeserializeOwned + 'static,
    T: Send + 'static,
{
    WrappedTask::from_job(Arc::new(move |args: A| Completion::Value(f(args))))
}

/// Wrap a function that can fail. An `Err` return rejects the future with
/// [`crate::Error::Worker`] carrying the error's `Display` output.
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// let parse = async_worker::wrap_fallible(|s: String| s.parse::<u8>());
/// assert_eq!(parse.call("42".to_string()).await, Ok(42));
/// assert!(parse.call("nope".to_string()).await.is_err());
/// # })
/// ```
pub fn wrap_fallible<A, T, E, F>(f: F) -> WrappedTask<A, T>
where
    F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
    E: fmt::Display,
    A: Serialize + DeserializeOwned + 'static,
    T: Send + 'static,
{
    WrappedTask::from_job(Arc::new(move |args: A| match f(args) {
        Ok(value) => Completion::Value(value),
        Err(err) => Completion::Error(err.to_string()),
    }))
}

/// Wrap an async function. The returned future is driven to completion on the worker thread, so
/// it must not depend on a runtime that only lives on the calling side.
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// let greet = async_worker::wrap_async(|name: String| async move {
///     Ok::<_, std::convert::Infallible>(format!("hello {name}"))
/// });
/// assert_eq!(greet.call("world".to_string()).await, Ok("hello world".to_string()));
/// # })
/// ```
pub fn wrap_async<A, T, E, F, Fut>(f: F) -> WrappedTask<A, T>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: fmt::Display,
    A: Serialize + DeserializeOwned + 'static,
    T: Send + 'static,
{
    WrappedTask::from_job(Arc::new(move |args: A| {
        let awaitable = f(args);
        Completion::Awaitable(async move { awaitable.await.map_err(|err| err.to_string()) }.boxed())
    }))
}

/// Reusable handle to a wrapped function.
///
/// Every [`WrappedTask::call`] spawns an independent worker thread. Handles are cheap to clone and
/// share the wrapped function.
pub struct WrappedTask<A, T> {
    name: Arc<str>,
    job: Arc<Job<A, T>>,
    config: Config,
}

impl<A, T> WrappedTask<A, T>
where
    A: Serialize + DeserializeOwned + 'static,
    T: Send + 'static,
{
    fn from_job(job: Arc<Job<A, T>>) -> Self {
        WrappedTask {
            name: Arc::from(DEFAULT_NAME),
            job,
            config: Config::default(),
        }
    }

    /// Name the task. The name shows up in worker thread names, logs and error messages.
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the deadline for every invocation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Name of the task.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration every invocation uses.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the wrapped function with `args` on a new worker thread.
    ///
    /// The thread is spawned right away; the returned future only waits for the result.
    pub fn call(&self, args: A) -> TaskFuture<T> {
        self.invoke(args, self.config.timeout)
    }

    /// Like [`WrappedTask::call`], but with a deadline that overrides the configured one for this
    /// invocation only. `None` waits indefinitely.
    pub fn call_with_timeout(&self, args: A, timeout: Option<Duration>) -> TaskFuture<T> {
        self.invoke(args, timeout)
    }

    fn invoke(&self, args: A, timeout: Option<Duration>) -> TaskFuture<T> {
        let started = Instant::now();
        let id = TaskId::next(self.name.clone());

        let request = match ExecutionRequest::new(id.clone(), &args) {
            Ok(request) => request,
            Err(err) => return TaskFuture::rejected(id, err),
        };

        let (future, settlement) = TaskFuture::pending(id.clone());
        let work = Work::new({
            let job = self.job.clone();
            let settlement = settlement.clone();
            move || Self::worker(&*job, request, settlement)
        });

        if let Err(err) = work.spawn(&id, &self.config) {
            settlement.settle(Err(err));
            return future;
        }
        tracing::debug!(task = %id, ?timeout, "spawned worker");

        let deadline = timeout.and_then(|timeout| {
            Deadline::new(
                id,
                started,
                timeout,
                settlement.expiry(),
                settlement.token().clone(),
            )
        });
        if let Some(deadline) = deadline {
            if let Err(err) = runtime::arm(deadline) {
                if settlement.settle(Err(err)) {
                    settlement.token().cancel();
                }
            }
        }

        future
    }

    /// Program of the worker thread.
    ///
    /// # Arguments
    ///
    /// * `job` - Wrapped function.
    /// * `request` - Invocation to run.
    /// * `settlement` - Settles the invocation's future.
    fn worker(job: &Job<A, T>, request: ExecutionRequest, settlement: Settlement<T>) {
        let token = settlement.token().clone();
        // Only now that the thread is running may a missing report count as a lost worker.
        let completer = settlement.into_completer();
        let _guard = runtime::enter(token.clone());

        tracing::trace!(task = %request.id(), "worker started");
        match serializer::execute(job, request, &token) {
            Some(outcome) => completer.complete(outcome),
            // Cancelled: the future was settled by whoever cancelled it, or dropped.
            None => drop(completer),
        }
    }
}

impl<A, T> Clone for WrappedTask<A, T> {
    fn clone(&self) -> Self {
        WrappedTask {
            name: self.name.clone(),
            job: self.job.clone(),
            config: self.config.clone(),
        }
    }
}

impl<A, T> fmt::Debug for WrappedTask<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedTask")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_call() {
        let task = wrap(|(): ()| 2 + 2);
        assert_eq!(task.call(()).await, Ok(4));
    }

    #[tokio::test]
    async fn test_reusable() {
        let task = wrap(|x: u64| x * x).named("square");
        assert_eq!(task.name(), "square");
        let clone = task.clone();
        assert_eq!(task.call(3).await, Ok(9));
        assert_eq!(clone.call(4).await, Ok(16));
    }

    #[tokio::test]
    async fn test_runs_on_other_thread() {
        let caller = std::thread::current().id();
        let task = wrap(|(): ()| format!("{:?}", std::thread::current().id()));
        let worker = task.call(()).await.unwrap();
        assert_ne!(worker, format!("{caller:?}"));
    }

    #[tokio::test]
    async fn test_thread_name() {
        let task = wrap(|(): ()| std::thread::current().name().map(str::to_string))
            .named("namer")
            .with_config(Config::new());
        let future = task.call(());
        let seq = future.id().seq();
        assert_eq!(future.await, Ok(Some(format!("namer#{seq}"))));
    }

    #[tokio::test]
    async fn test_config() {
        let task = wrap(|(): ()| ())
            .with_config(Config::new().thread_name("configured"))
            .with_timeout(Duration::from_secs(5));
        assert_eq!(task.config().timeout, Some(Duration::from_secs(5)));
        assert_eq!(task.config().thread_name.as_deref(), Some("configured"));
    }

    #[tokio::test]
    async fn test_fallible() {
        let task = wrap_fallible(|x: i32| {
            if x >= 0 {
                Ok(x)
            } else {
                Err(format!("{x} is negative"))
            }
        });
        assert_eq!(task.call(1).await, Ok(1));
        assert_eq!(task.call(-1).await, Err(Error::Worker("-1 is negative".to_string())));
    }

    #[tokio::test]
    async fn test_cancel_stops_async_work() {
        let reached = Arc::new(AtomicUsize::new(0));
        let task = wrap_async({
            let reached = reached.clone();
            move |(): ()| {
                let reached = reached.clone();
                async move {
                    futures::future::pending::<()>().await;
                    reached.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            }
        })
        .with_config(Config::new());
        let future = task.call(());
        future.cancel();
        assert_eq!(future.await, Err(Error::Cancelled));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }
}
