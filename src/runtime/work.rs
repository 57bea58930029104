use crate::config::Config;
use crate::error::Error;
use crate::serializer::TaskId;

/// Represents the program of one worker thread. Holds a closure inside.
///
/// The closure is explicitly [`Send`] because it will be sent over the thread boundary to be
/// executed in the worker thread. For the same reason, the closure must be `'static`.
///
/// # Usage
///
/// ```ignore
/// let work = Work::new(|| {
///     // ...
/// });
/// work.spawn(&id, &config)?;
/// ```
pub struct Work(Box<dyn FnOnce() + Send + 'static>);

impl Work {
    /// Create a new work item.
    ///
    /// # Arguments
    ///
    /// * `f` - Closure to execute.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Work(Box::new(f))
    }

    /// Execute work on the current thread.
    pub fn run(self) {
        let Work(f) = self;
        f();
    }

    /// Execute work on a newly spawned, detached thread.
    ///
    /// The thread is named after the configured prefix (or the task name) and the invocation
    /// sequence number. If spawning fails, the work is dropped without running.
    ///
    /// # Arguments
    ///
    /// * `id` - Invocation the thread runs.
    /// * `config` - Thread name prefix and stack size.
    pub fn spawn(self, id: &TaskId, config: &Config) -> Result<(), Error> {
        let prefix = config.thread_name.as_deref().unwrap_or(id.name());
        // Interior NUL bytes are not allowed in thread names.
        let name = format!("{}#{}", prefix.replace('\0', ""), id.seq());

        let mut builder = std::thread::Builder::new().name(name);
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        builder
            .spawn(move || self.run())
            .map(|_detached| ())
            .map_err(|err| Error::Spawn(err.to_string()))
    }
}
