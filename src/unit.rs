//! ExecutionUnit: the abstraction over "a background execution context" —
//! an independent tokio task here, communicating only by message, standing
//! in for whatever a host would otherwise run a job on (a thread, a
//! sandboxed worker, a sub-process).
//!
//! Deliberately a plain message-passing unit with no sandboxing of its own;
//! the message envelopes (`UnitMessage`/`UnitEvent`) form a disjoint union
//! so a unit's output is always unambiguous to decode.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{PoolError, PoolResult};
use crate::task::{Task, TaskId};

/// Unique identifier for an execution unit.
pub type UnitId = Uuid;

/// Lifecycle state of an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    /// Spawned but has not yet signalled readiness.
    Starting,
    /// Ready and not running a task.
    Idle,
    /// Running exactly one task.
    Busy,
    /// Reported an unrecoverable error; terminal for this instance.
    Error,
    /// Being terminated; will be removed from the manager's registry.
    Terminating,
    /// State could not be determined (e.g. a custom unit implementation
    /// that doesn't track one of the above).
    Unknown,
}

impl UnitState {
    fn encode(self) -> u8 {
        match self {
            UnitState::Starting => 0,
            UnitState::Idle => 1,
            UnitState::Busy => 2,
            UnitState::Error => 3,
            UnitState::Terminating => 4,
            UnitState::Unknown => 5,
        }
    }

    fn decode(v: u8) -> Self {
        match v {
            0 => UnitState::Starting,
            1 => UnitState::Idle,
            2 => UnitState::Busy,
            3 => UnitState::Error,
            4 => UnitState::Terminating,
            _ => UnitState::Unknown,
        }
    }
}

/// Supervisor → unit envelope.
#[derive(Debug, Clone)]
pub enum UnitMessage {
    /// Run `task` to completion.
    StartTask(Task),
    /// Best-effort request to abandon the named task.
    CancelTask(TaskId),
    /// Liveness probe; the unit should reply with `UnitEvent::Pong`.
    Ping,
    /// Domain-specific envelope outside the task-execution protocol (e.g.
    /// a [`crate::canvas::CanvasCommandBridge`] command). Opaque to the
    /// unit manager and the pool; only the sender and the unit interpret it.
    Custom(serde_json::Value),
}

/// Unit → supervisor envelope.
#[derive(Debug, Clone)]
pub enum UnitEvent {
    /// First signal a unit must emit before the manager marks it `Idle`.
    Ready {
        /// Unit that became ready.
        unit: UnitId,
    },
    /// Progress notification for a running task; resets the task's deadline.
    Progress {
        /// Unit reporting progress.
        unit: UnitId,
        /// Task the progress applies to.
        task: TaskId,
        /// Free-form progress payload (e.g. a percentage or phase name).
        note: serde_json::Value,
    },
    /// Task finished successfully.
    Completed {
        /// Unit that ran the task.
        unit: UnitId,
        /// Task that completed.
        task: TaskId,
        /// Result payload.
        result: serde_json::Value,
    },
    /// Task finished with an application-level failure.
    Failed {
        /// Unit that ran the task.
        unit: UnitId,
        /// Task that failed.
        task: TaskId,
        /// Unit-supplied error message.
        message: String,
    },
    /// Reply to `UnitMessage::Ping`.
    Pong {
        /// Unit replying.
        unit: UnitId,
    },
    /// The unit's background task ended, expectedly or not.
    Exited {
        /// Unit that exited.
        unit: UnitId,
        /// Populated when the exit was due to an internal error.
        cause: Option<String>,
    },
}

/// Running counters for one execution unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitStats {
    /// Tasks this unit has completed successfully.
    pub completed: u64,
    /// Tasks this unit has failed.
    pub errors: u64,
    /// Exponential moving average of task duration, in milliseconds.
    pub avg_duration_ms: f64,
}

/// Abstract contract over a background execution context.
///
/// At most one task may be in flight per unit: `is_busy()` is true iff a
/// task was started and no `Completed`/`Failed`/`Exited` event has been
/// observed for it yet.
#[async_trait]
pub trait ExecutionUnit: Send + Sync {
    /// Stable identifier assigned at creation.
    fn id(&self) -> UnitId;

    /// The kind this unit was spawned to serve (e.g. `"image"`, `"calc"`).
    fn kind(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> UnitState;

    /// When this unit was created.
    fn created_at(&self) -> SystemTime;

    /// When this unit last left the `Idle` state or reported activity.
    fn last_active_at(&self) -> SystemTime;

    /// Snapshot of this unit's running counters.
    fn stats(&self) -> UnitStats;

    /// `true` iff `state() == Idle`.
    fn is_idle(&self) -> bool {
        self.state() == UnitState::Idle
    }

    /// `true` iff `state() == Busy`.
    fn is_busy(&self) -> bool {
        self.state() == UnitState::Busy
    }

    /// `true` iff the unit can accept a new task right now.
    fn is_available(&self) -> bool {
        self.is_idle()
    }

    /// Fire-and-forget send to the unit.
    async fn post_message(&self, msg: UnitMessage) -> PoolResult<()>;

    /// Stop the unit. If `force`, any in-flight task is abandoned
    /// immediately rather than allowed to finish.
    async fn terminate(&self, force: bool) -> PoolResult<()>;
}

/// A unit backed by an independent tokio task, the default `unitFactory`
/// target for kinds with no host-specific execution unit. Simulates task
/// execution by interpreting the task payload (used in tests and as a
/// runnable default when no real execution backend is wired up).
pub struct SimulatedUnit {
    id: UnitId,
    kind: String,
    state: Arc<AtomicU8>,
    created_at: SystemTime,
    last_active_at: Arc<std::sync::Mutex<SystemTime>>,
    completed: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    avg_duration_bits: Arc<AtomicU64>,
    cmd_tx: mpsc::UnboundedSender<UnitMessage>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SimulatedUnit {
    /// Spawn a new simulated unit of `kind`, wiring its event stream to
    /// `events_tx` (shared by every unit the pool owns, per the "single
    /// channel the supervisor selects over" design).
    pub fn spawn(kind: impl Into<String>, events_tx: mpsc::UnboundedSender<UnitEvent>) -> Arc<Self> {
        let id = Uuid::new_v4();
        let kind = kind.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(UnitState::Starting.encode()));
        let last_active_at = Arc::new(std::sync::Mutex::new(SystemTime::now()));
        let completed = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(AtomicU64::new(0));
        let avg_duration_bits = Arc::new(AtomicU64::new(0));

        let worker = tokio::spawn(run_simulated_unit(
            id,
            cmd_rx,
            events_tx,
            state.clone(),
            last_active_at.clone(),
            completed.clone(),
            errors.clone(),
            avg_duration_bits.clone(),
        ));

        Arc::new(Self {
            id,
            kind,
            state,
            created_at: SystemTime::now(),
            last_active_at,
            completed,
            errors,
            avg_duration_bits,
            cmd_tx,
            worker: std::sync::Mutex::new(Some(worker)),
        })
    }
}

#[async_trait]
impl ExecutionUnit for SimulatedUnit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn state(&self) -> UnitState {
        UnitState::decode(self.state.load(Ordering::SeqCst))
    }

    fn created_at(&self) -> SystemTime {
        self.created_at
    }

    fn last_active_at(&self) -> SystemTime {
        *self.last_active_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stats(&self) -> UnitStats {
        UnitStats {
            completed: self.completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            avg_duration_ms: f64::from_bits(self.avg_duration_bits.load(Ordering::Relaxed)),
        }
    }

    async fn post_message(&self, msg: UnitMessage) -> PoolResult<()> {
        self.cmd_tx.send(msg).map_err(|_| PoolError::Internal("execution unit is no longer listening".into()))
    }

    async fn terminate(&self, force: bool) -> PoolResult<()> {
        self.state.store(UnitState::Terminating.encode(), Ordering::SeqCst);
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if force {
                handle.abort();
            } else {
                drop(self.cmd_tx.clone());
                let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_simulated_unit(
    id: UnitId,
    mut cmd_rx: mpsc::UnboundedReceiver<UnitMessage>,
    events_tx: mpsc::UnboundedSender<UnitEvent>,
    state: Arc<AtomicU8>,
    last_active_at: Arc<std::sync::Mutex<SystemTime>>,
    completed: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    avg_duration_bits: Arc<AtomicU64>,
) {
    let _ = events_tx.send(UnitEvent::Ready { unit: id });
    state.store(UnitState::Idle.encode(), Ordering::SeqCst);

    let mut current: Option<TaskId> = None;

    while let Some(msg) = cmd_rx.recv().await {
        match msg {
            UnitMessage::Ping => {
                let _ = events_tx.send(UnitEvent::Pong { unit: id });
            }
            UnitMessage::Custom(_) => {
                // No domain-specific behavior in the simulated unit; real
                // canvas-capable units interpret this envelope themselves.
            }
            UnitMessage::CancelTask(task_id) => {
                if current == Some(task_id) {
                    current = None;
                    state.store(UnitState::Idle.encode(), Ordering::SeqCst);
                    let _ = events_tx.send(UnitEvent::Failed { unit: id, task: task_id, message: "cancelled".into() });
                }
            }
            UnitMessage::StartTask(task) => {
                state.store(UnitState::Busy.encode(), Ordering::SeqCst);
                current = Some(task.id);
                *last_active_at.lock().unwrap_or_else(|e| e.into_inner()) = SystemTime::now();

                let started = SystemTime::now();
                match simulate_execute(&task).await {
                    Ok(result) => {
                        completed.fetch_add(1, Ordering::Relaxed);
                        update_avg(&avg_duration_bits, started.elapsed().unwrap_or_default());
                        let _ = events_tx.send(UnitEvent::Completed { unit: id, task: task.id, result });
                    }
                    Err(message) => {
                        errors.fetch_add(1, Ordering::Relaxed);
                        let _ = events_tx.send(UnitEvent::Failed { unit: id, task: task.id, message });
                    }
                }

                current = None;
                *last_active_at.lock().unwrap_or_else(|e| e.into_inner()) = SystemTime::now();
                state.store(UnitState::Idle.encode(), Ordering::SeqCst);
            }
        }
    }

    let _ = current;
    let _ = events_tx.send(UnitEvent::Exited { unit: id, cause: None });
}

fn update_avg(bits: &AtomicU64, elapsed: Duration) {
    let sample = elapsed.as_secs_f64() * 1000.0;
    let prev = f64::from_bits(bits.load(Ordering::Relaxed));
    let next = if prev == 0.0 { sample } else { prev * 0.8 + sample * 0.2 };
    bits.store(next.to_bits(), Ordering::Relaxed);
}

/// Interpret a task payload deterministically; used by [`SimulatedUnit`]
/// when no host-specific execution backend has been wired in. Recognizes a
/// few payload conventions used by this crate's own tests and by
/// [`crate::image::ImageProcessor`]: `{"fail": true}` always errors,
/// `{"sleep_ms": N}` waits before succeeding, anything else echoes back.
async fn simulate_execute(task: &Task) -> Result<serde_json::Value, String> {
    if let Some(true) = task.payload.get("fail").and_then(|v| v.as_bool()) {
        return Err("simulated failure".to_string());
    }
    if let Some(ms) = task.payload.get("sleep_ms").and_then(|v| v.as_u64()) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
    Ok(serde_json::json!({ "echo": task.payload, "task_type": task.task_type }))
}

/// Constructs an [`ExecutionUnit`] for a given kind. Pluggable so a host
/// can wire in real execution backends per kind instead of the default
/// simulated one.
pub type UnitFactory = Arc<dyn Fn(&str, mpsc::UnboundedSender<UnitEvent>) -> PoolResult<Arc<dyn ExecutionUnit>> + Send + Sync>;

/// The default factory, producing [`SimulatedUnit`]s for any kind.
pub fn default_unit_factory() -> UnitFactory {
    Arc::new(|kind, events_tx| Ok(SimulatedUnit::spawn(kind, events_tx) as Arc<dyn ExecutionUnit>))
}
