//! Task definitions: the immutable logical unit of work the scheduler moves
//! through QUEUED → RUNNING → {COMPLETED|FAILED|CANCELLED}.
//!
//! A task carries an opaque `serde_json::Value` payload and is routed by
//! `unit_kind` to whichever execution units declare themselves able to
//! handle that kind.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Unique identifier for a task.
pub type TaskId = Uuid;

/// Scheduling priority. Lower ordinal dequeues first.
///
/// `Ord` is derived from declaration order, so `Priority::High < Priority::Normal
/// < Priority::Low` holds and a `BinaryHeap<Reverse<_>>`-style min-heap (or a
/// max-heap over `Reverse<Priority>`) dequeues High before Normal before Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Executes before Normal and Low.
    High = 0,
    /// Default priority.
    Normal = 1,
    /// Executes after High and Normal.
    Low = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Lifecycle status of a task.
///
/// Valid transitions: `Queued -> Running -> {Completed, Failed, Cancelled}`,
/// plus `Running -> Queued` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting in the task queue.
    Queued,
    /// Assigned to an execution unit.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with a terminal failure (retries exhausted, unit error, timeout).
    Failed,
    /// Cancelled by the caller or by shutdown.
    Cancelled,
}

/// Which class of execution unit may run a task (e.g. `"image"`, `"calc"`,
/// `"canvas"`). Opaque to the scheduler beyond equality comparison.
pub type UnitKind = String;

/// Per-task knobs; anything left `None` falls back to the pool's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Caller-supplied task id; generated when absent.
    pub id: Option<TaskId>,
    /// Deadline for this attempt. Falls back to the pool default.
    pub timeout: Option<Duration>,
    /// Maximum retry attempts after the first failure. Falls back to the pool default.
    pub max_retries: Option<u32>,
    /// Base delay for exponential backoff between retries.
    pub retry_delay_base: Option<Duration>,
    /// Cap on a single backoff delay.
    pub max_backoff_delay: Option<Duration>,
    /// Upper bound of the uniform jitter added to each backoff delay.
    pub max_jitter: Option<Duration>,
    /// Free-form tags for observability; not interpreted by the scheduler.
    pub tags: Vec<String>,
    /// Byte buffers conceptually transferred (moved, not copied) to the unit.
    /// The pool does not read these; it only tracks their presence for stats.
    pub transferables: Vec<Vec<u8>>,
}

/// A unit of work submitted to the [`crate::pool::WorkerPool`].
///
/// Owned by the pool from `submit()` until a terminal status transition, at
/// which point the result is surrendered to the caller via the awaited
/// future.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Operation discriminator (e.g. `"image/scale"`, `"canvas/render"`).
    pub task_type: String,
    /// Which class of execution unit may run this task.
    pub unit_kind: UnitKind,
    /// Arbitrary payload understood by the target unit kind.
    pub payload: serde_json::Value,
    /// Scheduling priority.
    pub priority: Priority,
    /// When the task was submitted.
    pub submitted_at: SystemTime,
    /// When the task most recently started running, if it has.
    pub started_at: Option<SystemTime>,
    /// When the task reached a terminal state, if it has.
    pub completed_at: Option<SystemTime>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Effective per-task options (after merging with pool defaults).
    pub options: TaskOptions,
    /// 0-based retry counter. Incremented on each re-enqueue after failure,
    /// never reset by progress events.
    pub attempt: u32,
    /// Arbitrary key/value metadata carried alongside the task.
    pub metadata: HashMap<String, String>,
}

impl Task {
    /// Construct a new `Queued` task from a payload and options, generating
    /// an id when the caller didn't supply one.
    pub fn new(task_type: impl Into<String>, unit_kind: impl Into<UnitKind>, payload: serde_json::Value, options: TaskOptions) -> Self {
        let id = options.id.unwrap_or_else(Uuid::new_v4);
        Self {
            id,
            task_type: task_type.into(),
            unit_kind: unit_kind.into(),
            payload,
            priority: Priority::Normal,
            submitted_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            status: TaskStatus::Queued,
            options,
            attempt: 0,
            metadata: HashMap::new(),
        }
    }

    /// True once the task has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}
