//! Error taxonomy for the whole workspace.
//!
//! Boundary rule: per-attempt errors (dispatch, signer, storage, time sync)
//! never escape the retry loop — they are folded into its continue path.
//! Only an exhausted attempt budget or an explicit stop condition becomes a
//! user-visible task failure.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SnipeError>;

/// Errors raised by the transport layer during a single dispatch attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Per-attempt timeout (`ExecutionPolicy::timeout_ms`) exceeded.
    #[error("dispatch timed out")]
    Timeout,
    /// DNS, connect, or transfer failure.
    #[error("network error: {0}")]
    Network(String),
    /// The request was aborted before completing.
    #[error("dispatch aborted: {0}")]
    Aborted(String),
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum SnipeError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Invalid schedule input. Callers fall back to immediate execution
    /// instead of failing the task.
    #[error("schedule error: {0}")]
    Schedule(String),

    /// Store read/write failure. Logged at call sites; the in-memory state
    /// keeps going.
    #[error("storage error: {0}")]
    Storage(String),

    /// Time-sync failure. The previous clock offset stays in place.
    #[error("time sync error: {0}")]
    Sync(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("task error: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_display() {
        assert_eq!(DispatchError::Timeout.to_string(), "dispatch timed out");
        let e = SnipeError::from(DispatchError::Network("dns".into()));
        assert_eq!(e.to_string(), "network error: dns");
    }

    #[test]
    fn test_task_not_found_message() {
        let e = SnipeError::Task("not found: t1".into());
        assert!(e.to_string().contains("t1"));
    }
}
