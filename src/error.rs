use std::time::Duration;

/// An error that settled a [`crate::TaskFuture`] as rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The call arguments could not be encoded into an execution request. The worker thread was
    /// never spawned.
    #[error("failed to serialize task arguments: {0}")]
    Serialization(String),
    /// The work function failed. This covers a returned error, a rejected awaitable, a panic, and
    /// arguments that could not be decoded on the worker thread.
    #[error("{0}")]
    Worker(String),
    /// No outcome arrived before the deadline. The worker has been asked to stop.
    #[error("timed out: took longer than {}ms", .0.as_millis())]
    Timeout(Duration),
    /// The operating system refused to create the worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
    /// The invocation was cancelled through [`crate::TaskFuture::cancel`].
    #[error("task was cancelled")]
    Cancelled,
    /// The worker went away without reporting an outcome.
    #[error("worker thread exited without reporting an outcome")]
    WorkerLost,
    /// The deadline timer thread unexpectedly broke down.
    #[error("deadline timer runtime broken")]
    Runtime,
}

impl Error {
    /// Whether this error was caused by the deadline elapsing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_duration() {
        let error = Error::Timeout(Duration::from_millis(250));
        assert_eq!(error.to_string(), "timed out: took longer than 250ms");
        assert!(error.is_timeout());
    }

    #[test]
    fn test_worker_message_is_verbatim() {
        assert_eq!(Error::Worker("boom".to_string()).to_string(), "boom");
        assert!(!Error::WorkerLost.is_timeout());
    }
}
