//! EventHub: fan-out of task and unit lifecycle events to listeners.
//!
//! One event broadcasts to many independent sinks; a slow or failing sink
//! must never block another. Two independent event families are served:
//! `task` and `unit`.
//!
//! Delivery is via `tokio::sync::broadcast`: every subscriber gets its own
//! queue, so one lagging or dropped receiver cannot stall delivery to the
//! others — best-effort and non-blocking.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::task::{Priority, TaskId, TaskStatus};
use crate::unit::{UnitId, UnitState};

/// Task lifecycle events, emitted by [`crate::pool::WorkerPool`].
#[derive(Debug, Clone, Serialize)]
pub enum TaskEvent {
    /// Accepted into the queue.
    Queued {
        /// Task id.
        task: TaskId,
        /// Its priority at submission time.
        priority: Priority,
    },
    /// Dispatched to an execution unit.
    Started {
        /// Task id.
        task: TaskId,
        /// Unit running it.
        unit: UnitId,
        /// Attempt number, 0-based.
        attempt: u32,
    },
    /// A progress notification arrived from the running unit.
    Progress {
        /// Task id.
        task: TaskId,
        /// Unit-supplied payload.
        note: serde_json::Value,
    },
    /// Finished successfully.
    Completed {
        /// Task id.
        task: TaskId,
        /// Wall-clock duration of the final (successful) attempt, in ms.
        duration_ms: u64,
    },
    /// Finished with a terminal failure.
    Failed {
        /// Task id.
        task: TaskId,
        /// Human-readable failure reason.
        reason: String,
    },
    /// Cancelled before reaching a terminal outcome.
    Cancelled {
        /// Task id.
        task: TaskId,
    },
    /// Re-enqueued for another attempt after a failure.
    Retry {
        /// Task id.
        task: TaskId,
        /// The attempt number about to run.
        attempt: u32,
        /// Delay before the retry is eligible to run again.
        delay_ms: u64,
    },
}

impl TaskEvent {
    /// Task id this event concerns.
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Queued { task, .. }
            | TaskEvent::Started { task, .. }
            | TaskEvent::Progress { task, .. }
            | TaskEvent::Completed { task, .. }
            | TaskEvent::Failed { task, .. }
            | TaskEvent::Cancelled { task }
            | TaskEvent::Retry { task, .. } => *task,
        }
    }
}

/// Unit lifecycle events, emitted by [`crate::manager::UnitManager`].
#[derive(Debug, Clone, Serialize)]
pub enum UnitLifecycleEvent {
    /// A new unit was spawned.
    Created {
        /// Unit id.
        unit: UnitId,
        /// Kind it was spawned for.
        kind: String,
    },
    /// A unit's state changed.
    StateChange {
        /// Unit id.
        unit: UnitId,
        /// New state.
        state: UnitState,
    },
    /// A unit reported or caused an error.
    Error {
        /// Unit id.
        unit: UnitId,
        /// Error message.
        message: String,
    },
    /// A unit's background task ended.
    Exit {
        /// Unit id.
        unit: UnitId,
    },
}

/// Synchronous, non-blocking broadcaster for task and unit events.
///
/// Each family has its own channel; a listener interested in both
/// subscribes to each separately. Publishing never awaits a subscriber and
/// never fails loudly when no one is listening (`send` on an empty
/// broadcast channel is a silent no-op by design of `tokio::sync::broadcast`).
pub struct EventHub {
    task_tx: broadcast::Sender<TaskEvent>,
    unit_tx: broadcast::Sender<UnitLifecycleEvent>,
}

impl EventHub {
    /// Construct a hub with per-subscriber backlog `capacity`; a
    /// subscriber that falls more than `capacity` events behind skips ahead
    /// rather than blocking the publisher.
    pub fn new(capacity: usize) -> Self {
        let (task_tx, _) = broadcast::channel(capacity);
        let (unit_tx, _) = broadcast::channel(capacity);
        Self { task_tx, unit_tx }
    }

    /// Publish a task event to every current subscriber.
    pub fn emit_task(&self, event: TaskEvent) {
        trace!(?event, "task event");
        let _ = self.task_tx.send(event);
    }

    /// Publish a unit lifecycle event to every current subscriber.
    pub fn emit_unit(&self, event: UnitLifecycleEvent) {
        trace!(?event, "unit event");
        let _ = self.unit_tx.send(event);
    }

    /// Subscribe to the task event family.
    pub fn subscribe_tasks(&self) -> broadcast::Receiver<TaskEvent> {
        self.task_tx.subscribe()
    }

    /// Subscribe to the unit event family.
    pub fn subscribe_units(&self) -> broadcast::Receiver<UnitLifecycleEvent> {
        self.unit_tx.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Helper to read a task's status off a `TaskEvent` without a full match,
/// used by tests and simple listeners.
pub fn implied_status(event: &TaskEvent) -> TaskStatus {
    match event {
        TaskEvent::Queued { .. } => TaskStatus::Queued,
        TaskEvent::Started { .. } | TaskEvent::Progress { .. } => TaskStatus::Running,
        TaskEvent::Completed { .. } => TaskStatus::Completed,
        TaskEvent::Failed { .. } => TaskStatus::Failed,
        TaskEvent::Cancelled { .. } => TaskStatus::Cancelled,
        TaskEvent::Retry { .. } => TaskStatus::Queued,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_each_get_their_own_queue() {
        let hub = EventHub::new(8);
        let mut a = hub.subscribe_tasks();
        let mut b = hub.subscribe_tasks();

        let task = TaskId::new_v4();
        hub.emit_task(TaskEvent::Queued { task, priority: Priority::Normal });

        assert_eq!(a.recv().await.unwrap().task_id(), task);
        assert_eq!(b.recv().await.unwrap().task_id(), task);
    }

    #[tokio::test]
    async fn emit_with_no_subscribers_does_not_panic() {
        let hub = EventHub::new(8);
        hub.emit_task(TaskEvent::Cancelled { task: TaskId::new_v4() });
        hub.emit_unit(UnitLifecycleEvent::Exit { unit: UnitId::new_v4() });
    }
}
