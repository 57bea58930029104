use std::time::Duration;

use once_cell::sync::Lazy;

/// Environment variable holding the default timeout in milliseconds.
pub const TIMEOUT_ENV: &str = "ASYNC_WORKER_TIMEOUT_MS";

/// Environment variable holding the default worker stack size in bytes.
pub const STACK_SIZE_ENV: &str = "ASYNC_WORKER_STACK_SIZE";

/// Process defaults, read from the environment the first time a [`Config`] is defaulted.
static DEFAULTS: Lazy<Config> = Lazy::new(Config::from_env);

/// Configuration that applies to every invocation of a [`crate::WrappedTask`].
///
/// The configuration is fixed when the task is wrapped. A single invocation can still override
/// the timeout with [`crate::WrappedTask::call_with_timeout`].
///
/// # Usage
///
/// ```
/// # use std::time::Duration;
/// # use async_worker::Config;
/// let config = Config::new()
///     .timeout(Duration::from_millis(500))
///     .thread_name("resize");
/// assert_eq!(config.timeout, Some(Duration::from_millis(500)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Deadline for a single invocation. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Prefix for worker thread names. Falls back to the task name.
    pub thread_name: Option<String>,
    /// Stack size for worker threads. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Config {
    /// Create an empty configuration: no timeout, default thread name and stack size.
    ///
    /// Unlike [`Config::default`], this ignores the environment.
    pub fn new() -> Self {
        Config {
            timeout: None,
            thread_name: None,
            stack_size: None,
        }
    }

    /// Read configuration from [`TIMEOUT_ENV`] and [`STACK_SIZE_ENV`].
    ///
    /// Unset or empty variables leave the corresponding field empty. Values that do not parse
    /// are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Set the per-invocation deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Remove the per-invocation deadline.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set the worker thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Set the worker thread stack size in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Config {
            timeout: parse_var(TIMEOUT_ENV, lookup(TIMEOUT_ENV)).map(Duration::from_millis),
            thread_name: None,
            stack_size: parse_var(STACK_SIZE_ENV, lookup(STACK_SIZE_ENV)),
        }
    }
}

impl Default for Config {
    /// Process defaults as read from the environment once.
    fn default() -> Self {
        DEFAULTS.clone()
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value, "ignoring invalid environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_reads_values() {
        let config = Config::from_lookup(lookup(&[(TIMEOUT_ENV, "1500"), (STACK_SIZE_ENV, "65536")]));
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.stack_size, Some(65536));
        assert_eq!(config.thread_name, None);
    }

    #[test]
    fn test_from_lookup_empty_and_unset() {
        let config = Config::from_lookup(lookup(&[(TIMEOUT_ENV, "  ")]));
        assert_eq!(config, Config::new());
    }

    #[test]
    fn test_from_lookup_invalid_is_ignored() {
        let config = Config::from_lookup(lookup(&[(TIMEOUT_ENV, "soon"), (STACK_SIZE_ENV, "-1")]));
        assert_eq!(config.timeout, None);
        assert_eq!(config.stack_size, None);
    }

    #[test]
    fn test_builder() {
        let config = Config::new()
            .timeout(Duration::from_secs(1))
            .thread_name("encoder")
            .stack_size(1 << 20)
            .no_timeout();
        assert_eq!(config.timeout, None);
        assert_eq!(config.thread_name.as_deref(), Some("encoder"));
        assert_eq!(config.stack_size, Some(1 << 20));
    }
}
