//! WorkerPool: the scheduler that ties the queue, timeout manager,
//! unit manager, and event hub together into one supervisor task.
//!
//! A single actor owns all mutable scheduling state and drives a select
//! loop over task submissions, unit events, timeout expiry, and periodic
//! maintenance; callers communicate with it only through an unbounded
//! command channel.
//!
//! Nothing here is behind a lock: [`Supervisor`] is only ever driven by its
//! own spawned task, and every external operation is a message round-trip —
//! a lock-per-field design would invite races between the fields it locks
//! separately, so there are no internal locks at all.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult, TaskFailure};
use crate::events::{EventHub, TaskEvent, UnitLifecycleEvent};
use crate::manager::{UnitManager, UnitPoolOptions};
use crate::metrics::Metrics;
use crate::queue::TaskQueue;
use crate::task::{Priority, Task, TaskId, TaskOptions, TaskStatus, UnitKind};
use crate::timeout::{backoff_delay, RetryPolicy, TimeoutEvent, TimeoutManager, TimeoutStats};
use crate::unit::{ExecutionUnit, UnitEvent, UnitFactory, UnitId, UnitMessage};
use crate::config::PoolSettings;

/// A task that has been accepted but not yet resolved; the caller awaits
/// [`Submission::wait`] for the terminal outcome.
pub struct Submission {
    /// Id assigned to the submitted task.
    pub id: TaskId,
    result_rx: oneshot::Receiver<Result<serde_json::Value, TaskFailure>>,
}

impl Submission {
    /// Await the task's terminal outcome. Resolves to
    /// `Err(TaskFailure::Cancelled)` if the pool is dropped before the task
    /// settles.
    pub async fn wait(self) -> Result<serde_json::Value, TaskFailure> {
        self.result_rx.await.unwrap_or(Err(TaskFailure::Cancelled))
    }
}

/// Point-in-time snapshot of the pool's bookkeeping.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Tasks waiting for a unit.
    pub queued: usize,
    /// Tasks currently assigned to a unit.
    pub running: usize,
    /// Tasks waiting out a retry backoff.
    pub retrying: usize,
    /// Tasks parked in the dead-letter queue.
    pub dead_letter: usize,
    /// Per-kind unit pool stats.
    pub units: Vec<crate::manager::UnitKindStats>,
    /// Deadline bookkeeping counters.
    pub timeouts: TimeoutStats,
}

struct SubmitRequest {
    task_type: String,
    unit_kind: UnitKind,
    payload: serde_json::Value,
    priority: Priority,
    options: TaskOptions,
    respond: oneshot::Sender<PoolResult<TaskId>>,
    result_tx: oneshot::Sender<Result<serde_json::Value, TaskFailure>>,
}

enum Command {
    Submit(SubmitRequest),
    Cancel { id: TaskId, respond: oneshot::Sender<bool> },
    Status { id: TaskId, respond: oneshot::Sender<Option<TaskStatus>> },
    Pending { respond: oneshot::Sender<Vec<Task>> },
    Running { respond: oneshot::Sender<Vec<Task>> },
    DeadLetters { respond: oneshot::Sender<Vec<Task>> },
    Stats { respond: oneshot::Sender<PoolStats> },
    Shutdown { force: bool, respond: oneshot::Sender<()> },
}

/// Handle to a running pool. Cloning is cheap; every clone talks to the
/// same supervisor task. Dropping every handle begins a graceful shutdown.
#[derive(Clone)]
pub struct WorkerPool {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: Arc<EventHub>,
    metrics: Arc<Metrics>,
}

impl WorkerPool {
    /// Start the supervisor task and return a handle to it.
    pub fn start(config: PoolSettings, factory: UnitFactory) -> PoolResult<Self> {
        let events = Arc::new(EventHub::default());
        let metrics = Arc::new(Metrics::new()?);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let unit_options = UnitPoolOptions {
            min_units: config.default_min_units,
            max_units: config.default_max_units,
            idle_timeout: config.default_idle_timeout,
            ..Default::default()
        };
        let (units, unit_events_rx) = UnitManager::new(factory, unit_options);

        let supervisor = Supervisor {
            queue: TaskQueue::new(),
            timeouts: TimeoutManager::new(),
            units,
            unit_events_rx,
            cmd_rx,
            cmd_open: true,
            events: events.clone(),
            metrics: metrics.clone(),
            config,
            running: HashMap::new(),
            retrying: HashMap::new(),
            dead_letter: VecDeque::new(),
            results: HashMap::new(),
            shutting_down: false,
            force_deadline: None,
        };

        tokio::spawn(supervisor.run());
        Ok(Self { cmd_tx, events, metrics })
    }

    /// Submit a task. Returns once the pool has accepted (or rejected) it
    /// into the queue; await [`Submission::wait`] separately for the
    /// terminal result.
    pub async fn submit(
        &self,
        task_type: impl Into<String>,
        unit_kind: impl Into<UnitKind>,
        payload: serde_json::Value,
        priority: Priority,
        options: TaskOptions,
    ) -> PoolResult<Submission> {
        let (respond, respond_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Submit(SubmitRequest {
                task_type: task_type.into(),
                unit_kind: unit_kind.into(),
                payload,
                priority,
                options,
                respond,
                result_tx,
            }))
            .map_err(|_| PoolError::Shutdown)?;
        let id = respond_rx.await.map_err(|_| PoolError::Shutdown)??;
        Ok(Submission { id, result_rx })
    }

    /// Best-effort cancellation. `true` if the task was found queued,
    /// retrying, or running and was cancelled; `false` if it had already
    /// reached a terminal state or was never known to this pool.
    pub async fn cancel(&self, id: TaskId) -> PoolResult<bool> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Cancel { id, respond }).map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)
    }

    /// Current status of a task the pool still has bookkeeping for.
    /// `None` once a task's result has been delivered and claimed.
    pub async fn get_status(&self, id: TaskId) -> PoolResult<Option<TaskStatus>> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Status { id, respond }).map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)
    }

    /// Snapshot of tasks waiting to be dispatched (queued or retrying).
    pub async fn get_pending(&self) -> PoolResult<Vec<Task>> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Pending { respond }).map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)
    }

    /// Snapshot of tasks currently assigned to a unit.
    pub async fn get_running(&self) -> PoolResult<Vec<Task>> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Running { respond }).map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)
    }

    /// Snapshot of the bounded ring of recently dead-lettered tasks (see
    /// [`PoolSettings::dead_letter_queue_size`]), oldest first.
    pub async fn dead_letters(&self) -> PoolResult<Vec<Task>> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx.send(Command::DeadLetters { respond }).map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)
    }

    /// Aggregate scheduler/unit/timeout statistics.
    pub async fn get_stats(&self) -> PoolResult<PoolStats> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Stats { respond }).map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)
    }

    /// Stop accepting new submissions. If `force`, every queued, retrying,
    /// and running task is cancelled immediately and units are terminated
    /// without waiting for in-flight work. Otherwise the pool drains
    /// naturally (or forces after `PoolSettings::shutdown_grace_period`).
    /// Resolves once the supervisor has fully stopped.
    pub async fn shutdown(&self, force: bool) -> PoolResult<()> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Shutdown { force, respond }).map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::Shutdown)
    }

    /// Subscribe to task/unit lifecycle events.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Prometheus metrics registered by this pool.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

#[derive(Clone)]
struct RunningTask {
    task: Task,
    unit: UnitId,
}

struct Supervisor {
    queue: TaskQueue,
    timeouts: TimeoutManager,
    units: UnitManager,
    unit_events_rx: mpsc::UnboundedReceiver<UnitEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_open: bool,
    events: Arc<EventHub>,
    metrics: Arc<Metrics>,
    config: PoolSettings,
    running: HashMap<TaskId, RunningTask>,
    retrying: HashMap<TaskId, Task>,
    dead_letter: VecDeque<Task>,
    results: HashMap<TaskId, oneshot::Sender<Result<serde_json::Value, TaskFailure>>>,
    shutting_down: bool,
    force_deadline: Option<Instant>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.shutting_down && self.running.is_empty() && self.queue.is_empty() && self.retrying.is_empty() {
                break;
            }

            tokio::select! {
                maybe_cmd = self.cmd_rx.recv(), if self.cmd_open => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            self.cmd_open = false;
                            self.begin_shutdown(false);
                        }
                    }
                }
                Some(ev) = self.unit_events_rx.recv() => {
                    self.handle_unit_event(ev);
                }
                Some(ev) = self.timeouts.next_event(), if !self.timeouts.is_empty() => {
                    if let TimeoutEvent::Expired { owner } = ev {
                        self.handle_deadline_expired(owner);
                    }
                }
                _ = maintenance.tick() => {
                    self.units.reap_idle().await;
                    self.metrics.tasks.queue_depth.set(self.queue.size() as f64);
                    if self.shutting_down {
                        if let Some(deadline) = self.force_deadline {
                            if Instant::now() >= deadline {
                                info!("shutdown grace period elapsed, forcing cancellation");
                                self.force_cancel_all();
                            }
                        }
                    }
                }
            }

            self.try_dispatch();
        }

        self.units.close_all(true).await;
        info!("worker pool supervisor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit(req) => self.handle_submit(req),
            Command::Cancel { id, respond } => {
                let _ = respond.send(self.cancel_task(id));
            }
            Command::Status { id, respond } => {
                let _ = respond.send(self.status_of(id));
            }
            Command::Pending { respond } => {
                let mut pending = self.queue.get_all();
                pending.extend(self.retrying.values().cloned());
                let _ = respond.send(pending);
            }
            Command::Running { respond } => {
                let _ = respond.send(self.running.values().map(|r| r.task.clone()).collect());
            }
            Command::DeadLetters { respond } => {
                let _ = respond.send(self.dead_letter.iter().cloned().collect());
            }
            Command::Stats { respond } => {
                let _ = respond.send(PoolStats {
                    queued: self.queue.size(),
                    running: self.running.len(),
                    retrying: self.retrying.len(),
                    dead_letter: self.dead_letter.len(),
                    units: self.units.stats(),
                    timeouts: self.timeouts.get_stats(),
                });
            }
            Command::Shutdown { force, respond } => {
                self.begin_shutdown(force);
                let _ = respond.send(());
            }
        }
    }

    fn handle_submit(&mut self, req: SubmitRequest) {
        if self.shutting_down {
            let _ = req.respond.send(Err(PoolError::Shutdown));
            let _ = req.result_tx.send(Err(TaskFailure::Rejected("pool is shutting down".into())));
            return;
        }
        if self.queue.size() >= self.config.max_queue_size {
            let _ = req.respond.send(Err(PoolError::QueueFull(self.config.max_queue_size)));
            let _ = req.result_tx.send(Err(TaskFailure::Rejected("queue is full".into())));
            return;
        }

        let mut task = Task::new(req.task_type, req.unit_kind, req.payload, req.options);
        task.priority = req.priority;

        let _ = req.respond.send(Ok(task.id));
        self.results.insert(task.id, req.result_tx);
        self.events.emit_task(TaskEvent::Queued { task: task.id, priority: task.priority });
        self.metrics.tasks.submitted_total.inc();
        self.queue.enqueue(task);
    }

    fn cancel_task(&mut self, id: TaskId) -> bool {
        if let Some(running) = self.running.remove(&id) {
            self.timeouts.clear(id);
            self.units.release(&running.task.unit_kind, running.unit);
            if let Some(unit) = self.units.find(running.unit) {
                tokio::spawn(async move {
                    let _ = unit.post_message(UnitMessage::CancelTask(id)).await;
                });
            }
            self.resolve_cancelled(id);
            return true;
        }
        if self.retrying.remove(&id).is_some() {
            self.timeouts.clear(id);
            self.resolve_cancelled(id);
            return true;
        }
        if self.queue.remove(id) {
            self.resolve_cancelled(id);
            return true;
        }
        false
    }

    fn resolve_cancelled(&mut self, id: TaskId) {
        self.events.emit_task(TaskEvent::Cancelled { task: id });
        self.metrics.tasks.cancelled_total.inc();
        if let Some(tx) = self.results.remove(&id) {
            let _ = tx.send(Err(TaskFailure::Cancelled));
        }
    }

    fn status_of(&self, id: TaskId) -> Option<TaskStatus> {
        if self.running.contains_key(&id) {
            return Some(TaskStatus::Running);
        }
        if self.retrying.contains_key(&id) {
            return Some(TaskStatus::Queued);
        }
        if self.queue.get_all().iter().any(|t| t.id == id) {
            return Some(TaskStatus::Queued);
        }
        None
    }

    fn begin_shutdown(&mut self, force: bool) {
        self.shutting_down = true;
        if force {
            self.force_cancel_all();
        } else if self.force_deadline.is_none() {
            self.force_deadline = Some(Instant::now() + self.config.shutdown_grace_period);
        }
    }

    fn force_cancel_all(&mut self) {
        let queued_ids: Vec<TaskId> = self.queue.get_all().iter().map(|t| t.id).collect();
        for id in queued_ids {
            self.queue.remove(id);
            self.resolve_cancelled(id);
        }
        let retrying_ids: Vec<TaskId> = self.retrying.keys().copied().collect();
        for id in retrying_ids {
            self.retrying.remove(&id);
            self.timeouts.clear(id);
            self.resolve_cancelled(id);
        }
        let running_ids: Vec<TaskId> = self.running.keys().copied().collect();
        for id in running_ids {
            if let Some(running) = self.running.remove(&id) {
                self.timeouts.clear(id);
                self.units.release(&running.task.unit_kind, running.unit);
                if let Some(unit) = self.units.find(running.unit) {
                    tokio::spawn(async move {
                        let _ = unit.post_message(UnitMessage::CancelTask(id)).await;
                    });
                }
            }
            self.resolve_cancelled(id);
        }
    }

    /// Assign as many queued tasks to idle units as currently possible.
    /// Tasks that can't be placed (no idle unit and the kind is already at
    /// its cap, or its circuit breaker is open) are put back at the end of
    /// the pass, preserving their relative order.
    fn try_dispatch(&mut self) {
        let mut undispatched = Vec::new();
        while let Some(task) = self.queue.dequeue() {
            match self.units.get_idle_unit(&task.unit_kind) {
                Some(unit) => self.start_task(task, unit),
                None => undispatched.push(task),
            }
        }
        for task in undispatched {
            self.queue.enqueue(task);
        }
    }

    fn start_task(&mut self, mut task: Task, unit: Arc<dyn ExecutionUnit>) {
        task.status = TaskStatus::Running;
        task.started_at = Some(SystemTime::now());

        let timeout = task.options.timeout.unwrap_or(self.config.default_timeout);
        self.timeouts.set(task.id, timeout);

        let unit_id = unit.id();
        // The unit's own state only flips to `Busy` once its worker
        // processes `StartTask`, which never happens within this
        // synchronous dispatch pass — reserve it now so a later task in the
        // same pass can't be handed the same still-`Idle` unit.
        self.units.reserve(&task.unit_kind, unit_id);
        self.events.emit_task(TaskEvent::Started { task: task.id, unit: unit_id, attempt: task.attempt });
        self.events.emit_unit(UnitLifecycleEvent::StateChange { unit: unit_id, state: crate::unit::UnitState::Busy });

        self.running.insert(task.id, RunningTask { task: task.clone(), unit: unit_id });

        tokio::spawn(async move {
            if unit.post_message(UnitMessage::StartTask(task)).await.is_err() {
                warn!("execution unit closed before accepting task");
            }
        });
    }

    fn handle_unit_event(&mut self, event: UnitEvent) {
        match event {
            UnitEvent::Ready { unit } => {
                if let Some(u) = self.units.find(unit) {
                    self.events.emit_unit(UnitLifecycleEvent::Created { unit, kind: u.kind().to_string() });
                    self.metrics.units.units_spawned_total.inc();
                }
            }
            UnitEvent::Progress { task, note, .. } => {
                if let Some(running) = self.running.get(&task) {
                    let timeout = running.task.options.timeout.unwrap_or(self.config.default_timeout);
                    // Progress resets the deadline only; the attempt counter is untouched.
                    self.timeouts.reset(task, timeout);
                    self.events.emit_task(TaskEvent::Progress { task, note });
                }
            }
            UnitEvent::Completed { task, result, .. } => {
                self.timeouts.mark_completed(task);
                if let Some(running) = self.running.remove(&task) {
                    self.units.record_outcome(&running.task.unit_kind, true);
                    self.units.release(&running.task.unit_kind, running.unit);
                    self.events.emit_unit(UnitLifecycleEvent::StateChange { unit: running.unit, state: crate::unit::UnitState::Idle });
                    let duration = running
                        .task
                        .started_at
                        .and_then(|s| SystemTime::now().duration_since(s).ok())
                        .unwrap_or_default();
                    self.metrics.tasks.completed_total.inc();
                    self.metrics.tasks.duration_seconds.with_label_values(&[running.task.unit_kind.as_str()]).observe(duration.as_secs_f64());
                    self.events.emit_task(TaskEvent::Completed { task, duration_ms: duration.as_millis() as u64 });
                    if let Some(tx) = self.results.remove(&task) {
                        let _ = tx.send(Ok(result));
                    }
                }
            }
            UnitEvent::Failed { task, message, .. } => {
                self.timeouts.clear(task);
                if let Some(running) = self.running.remove(&task) {
                    self.units.record_outcome(&running.task.unit_kind, false);
                    self.units.release(&running.task.unit_kind, running.unit);
                    self.events.emit_unit(UnitLifecycleEvent::StateChange { unit: running.unit, state: crate::unit::UnitState::Idle });
                    self.events.emit_unit(UnitLifecycleEvent::Error { unit: running.unit, message: message.clone() });
                    self.fail_or_retry(running.task, TaskFailure::UnitError(message));
                }
            }
            UnitEvent::Pong { .. } => {}
            UnitEvent::Exited { unit, cause } => {
                if let Some((task_id, running)) = self.running.iter().find(|(_, r)| r.unit == unit).map(|(k, v)| (*k, v.clone())) {
                    self.running.remove(&task_id);
                    self.timeouts.clear(task_id);
                    self.units.record_outcome(&running.task.unit_kind, false);
                    self.fail_or_retry(running.task, TaskFailure::UnitExit);
                }
                self.units.forget(unit);
                self.events.emit_unit(UnitLifecycleEvent::Exit { unit });
                if let Some(cause) = cause {
                    warn!(unit = %unit, cause, "execution unit exited with error");
                }
            }
        }
    }

    fn handle_deadline_expired(&mut self, owner: TaskId) {
        if let Some(running) = self.running.remove(&owner) {
            self.units.record_outcome(&running.task.unit_kind, false);
            self.units.release(&running.task.unit_kind, running.unit);
            if let Some(unit) = self.units.find(running.unit) {
                tokio::spawn(async move {
                    let _ = unit.post_message(UnitMessage::CancelTask(owner)).await;
                });
            }
            self.fail_or_retry(running.task, TaskFailure::Timeout);
            return;
        }
        if let Some(task) = self.retrying.remove(&owner) {
            debug!(task = %task.id, attempt = task.attempt, "backoff elapsed, redispatching");
            self.queue.enqueue(task);
        }
    }

    fn fail_or_retry(&mut self, mut task: Task, failure: TaskFailure) {
        let max_retries = task.options.max_retries.unwrap_or(self.config.default_max_retries);
        if task.attempt < max_retries {
            task.attempt += 1;
            task.status = TaskStatus::Queued;

            let policy = RetryPolicy {
                max_retries: 0,
                initial_delay: task.options.retry_delay_base.unwrap_or(self.config.default_retry_delay_base),
                max_backoff_delay: task.options.max_backoff_delay.unwrap_or(self.config.default_max_backoff_delay),
                max_jitter: task.options.max_jitter.unwrap_or(self.config.default_max_jitter),
            };
            let delay = backoff_delay(policy, task.attempt);

            self.metrics.tasks.retries_total.with_label_values(&[task.attempt.to_string().as_str()]).inc();
            self.events.emit_task(TaskEvent::Retry { task: task.id, attempt: task.attempt, delay_ms: delay.as_millis() as u64 });

            self.timeouts.set(task.id, delay);
            self.retrying.insert(task.id, task);
        } else {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(SystemTime::now());
            self.metrics.tasks.failed_total.inc();
            self.events.emit_task(TaskEvent::Failed { task: task.id, reason: failure.to_string() });

            let id = task.id;
            self.dead_letter_push(task);
            if let Some(tx) = self.results.remove(&id) {
                let _ = tx.send(Err(failure));
            }
        }
    }

    fn dead_letter_push(&mut self, task: Task) {
        if self.dead_letter.len() >= self.config.dead_letter_queue_size {
            self.dead_letter.pop_front();
        }
        self.dead_letter.push_back(task);
        self.metrics.tasks.dead_lettered_total.inc();
    }
}
