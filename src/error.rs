//! Error types for the worker pool runtime.
//!
//! One `thiserror`-derived enum with `From` impls for the infrastructure
//! errors that cross into it, and a crate-wide `PoolResult` alias.

use crate::task::TaskId;
use crate::unit::UnitId;

/// Error kinds surfaced by the worker pool runtime.
///
/// Cache errors and malformed unit envelopes never reach this enum at the
/// `ImageProcessor`/`WorkerPool` boundary — they are logged and treated as
/// a miss or ignored instead of being surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// `submit` called with a payload or `unit_kind` the pool can't route.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Bounded queue saturated.
    #[error("task queue is full (max {0})")]
    QueueFull(usize),

    /// No unit available and the pool cannot grow to serve the request.
    #[error("no execution unit available for kind {0:?}")]
    NoUnitAvailable(String),

    /// Deadline expired after all configured retries were exhausted.
    #[error("task {0} timed out after exhausting retries")]
    Timeout(TaskId),

    /// The execution unit reported a failure while running the task.
    #[error("unit {unit} reported failure for task {task}: {message}")]
    UnitError {
        /// Unit that reported the failure.
        unit: UnitId,
        /// Task that was running.
        task: TaskId,
        /// Unit-supplied message.
        message: String,
    },

    /// The execution unit exited unexpectedly while a task was in flight.
    #[error("unit {unit} exited unexpectedly while running task {task}")]
    UnitExit {
        /// Unit that exited.
        unit: UnitId,
        /// Task that was in flight.
        task: TaskId,
    },

    /// Cancelled by the caller, or as a side effect of shutdown.
    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    /// `submit` called after the pool has begun or completed shutdown.
    #[error("pool is shutting down")]
    Shutdown,

    /// A unit produced an envelope the bridge could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Wraps unexpected I/O failures from the persistent cache tier.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps (de)serialization failures.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violation; should not occur in correct callers.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used throughout the crate.
pub type PoolResult<T> = Result<T, PoolError>;

/// The subset of [`PoolError`] a task can terminally fail with; returned to
/// the caller via the `submit` future.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskFailure {
    /// Deadline expired after all retries.
    #[error("timeout after exhausting retries")]
    Timeout,
    /// The unit reported an application-level failure.
    #[error("unit error: {0}")]
    UnitError(String),
    /// The unit exited unexpectedly mid-task.
    #[error("unit exited unexpectedly")]
    UnitExit,
    /// Cancelled by the caller or by shutdown.
    #[error("cancelled")]
    Cancelled,
    /// `submit` was rejected outright (queue full, shutdown, bad argument).
    #[error("rejected: {0}")]
    Rejected(String),
}
