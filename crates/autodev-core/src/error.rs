//! Error kinds produced and consumed by the core.
//!
//! The queue's retry envelope keys off [`CoreError::is_retryable`]:
//! transient failures go back to the queue with backoff, caller errors
//! surface synchronously, and CLI/timeout/cancel terminate the execution
//! in the matching terminal state.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use autodev_db::models::TaskStatus;

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error kinds of the task-execution pipeline.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A refused state edge. Caller error, never retried.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// A referenced entity is missing. Caller error, never retried.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    /// Duplicate branch/worktree path or a concurrent transition lost its
    /// optimistic-lock race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Disk space, path length, or concurrency limits.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A git command, broker publish, or storage operation failed
    /// transiently.
    #[error("external failure: {0}")]
    External(anyhow::Error),

    /// The CLI child exited non-zero, or a required frame failed to parse.
    #[error("CLI failure: {0}")]
    Cli(String),

    /// The execution exceeded its allowed wall time.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// Explicit cancel or shutdown.
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    /// Wrap any error as an [`CoreError::External`] transient failure.
    pub fn external(err: impl Into<anyhow::Error>) -> Self {
        Self::External(err.into())
    }

    /// Whether the queue should retry a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::ResourceExhausted(_) | Self::External(_)
        )
    }

    /// Whether this error should never count against a job's attempt cap
    /// (backpressure rather than failure).
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}
