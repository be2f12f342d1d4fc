//! TimeoutManager: deadline tracking with exponential-backoff retry.
//!
//! Event-driven rather than callback-driven: instead of taking
//! `on_expire`/`on_retry` closures, [`TimeoutManager::next_event`] is awaited
//! by the supervisor ([`crate::pool::WorkerPool`]'s dispatch loop) inside a
//! `tokio::select!`. No polling loop — one deadline fires at a time via
//! `tokio_util::time::DelayQueue`, which keeps set/reset/cancel at O(log n)
//! regardless of how many deadlines are outstanding.

use futures::StreamExt;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;

use crate::task::TaskId;

/// Status of a single owner's deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    /// Armed and waiting to fire.
    Active,
    /// Fired without a further retry (final).
    Fired,
    /// Replaced or explicitly cleared before firing.
    Cancelled,
    /// Fired and a retry deadline was armed in its place.
    Retrying,
}

/// Retry policy captured when a deadline is armed with `set_with_retry`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of retries before declaring final failure.
    pub max_retries: u32,
    /// Base delay used in `base * 2^attempt`.
    pub initial_delay: Duration,
    /// Cap applied to the computed backoff delay.
    pub max_backoff_delay: Duration,
    /// Upper bound (exclusive) of the uniform jitter added to each backoff.
    pub max_jitter: Duration,
}

/// Bookkeeping for one owner's deadline.
#[derive(Debug, Clone)]
pub struct TimeoutRecord {
    /// Id of the task/owner this deadline tracks.
    pub owner_id: TaskId,
    /// Current attempt number (0 for the first deadline).
    pub attempt: u32,
    /// The delay originally used to arm the current deadline.
    pub original_delay: Duration,
    /// Current status.
    pub status: TimeoutStatus,
    /// Retry policy, if this deadline was armed via `set_with_retry`.
    pub retry: Option<RetryPolicy>,
}

/// Outcome of a deadline firing, returned by [`TimeoutManager::next_event`].
#[derive(Debug, Clone)]
pub enum TimeoutEvent {
    /// A plain (`set`, no retry policy) deadline expired.
    Expired {
        /// Owner whose deadline expired.
        owner: TaskId,
    },
    /// A retry-eligible deadline expired and a follow-up deadline was armed.
    RetryScheduled {
        /// Owner being retried.
        owner: TaskId,
        /// The attempt number about to run (1-based: first retry is 1).
        attempt: u32,
        /// Delay before the new deadline fires.
        next_delay: Duration,
    },
    /// A retry-eligible deadline expired with no retries left.
    FinalFailure {
        /// Owner whose retries are exhausted.
        owner: TaskId,
    },
}

/// Aggregate counters across every tracked deadline.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TimeoutStats {
    /// Total deadlines ever armed.
    pub created: u64,
    /// Deadlines cleared by their owner completing before firing.
    pub completed: u64,
    /// Deadlines cancelled (superseded or explicitly cleared).
    pub cancelled: u64,
    /// Deadlines that reached final failure.
    pub failed: u64,
    /// Number of retry deadlines armed.
    pub retried: u64,
    /// Deadlines currently armed.
    pub active: u64,
}

/// Tracks named deadlines and drives exponential-backoff retry scheduling.
///
/// Single-threaded: every method takes `&mut self` and is meant to be called
/// only from the owning supervisor task.
pub struct TimeoutManager {
    queue: DelayQueue<TaskId>,
    keys: HashMap<TaskId, Key>,
    records: HashMap<TaskId, TimeoutRecord>,
    stats: TimeoutStats,
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutManager {
    /// Create an empty manager with no armed deadlines.
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            keys: HashMap::new(),
            records: HashMap::new(),
            stats: TimeoutStats::default(),
        }
    }

    /// Arm a one-shot deadline for `owner`. Replacing a prior deadline for
    /// the same owner cancels it (it does not fire). Negative/zero delays
    /// behave as zero. Calling `set` again with an identical delay while the
    /// owner's deadline is still `Active` is a no-op (no double-fire).
    pub fn set(&mut self, owner: TaskId, delay: Duration) {
        if let Some(record) = self.records.get(&owner) {
            if record.status == TimeoutStatus::Active && record.original_delay == delay {
                return;
            }
        }
        self.clear(owner);

        let key = self.queue.insert(owner, delay);
        self.keys.insert(owner, key);
        self.records.insert(
            owner,
            TimeoutRecord {
                owner_id: owner,
                attempt: 0,
                original_delay: delay,
                status: TimeoutStatus::Active,
                retry: None,
            },
        );
        self.stats.created += 1;
        self.stats.active += 1;
    }

    /// Arm a deadline that automatically reschedules itself (with
    /// exponential backoff + jitter) up to `policy.max_retries` times before
    /// [`TimeoutEvent::FinalFailure`] is reported.
    pub fn set_with_retry(&mut self, owner: TaskId, policy: RetryPolicy) {
        self.clear(owner);

        let delay = policy.initial_delay;
        let key = self.queue.insert(owner, delay);
        self.keys.insert(owner, key);
        self.records.insert(
            owner,
            TimeoutRecord {
                owner_id: owner,
                attempt: 0,
                original_delay: delay,
                status: TimeoutStatus::Active,
                retry: Some(policy),
            },
        );
        self.stats.created += 1;
        self.stats.active += 1;
    }

    /// Reset the owner's deadline to fire `delay` from now, without
    /// disturbing its retry policy or attempt counter. Used when a task
    /// reports progress: progress resets the deadline only, never the
    /// attempt counter — otherwise a slow-but-steady task would never
    /// exhaust its retries on genuine stalls.
    pub fn reset(&mut self, owner: TaskId, delay: Duration) {
        let Some(key) = self.keys.get(&owner).copied() else {
            return;
        };
        self.queue.reset(&key, delay);
        if let Some(record) = self.records.get_mut(&owner) {
            record.original_delay = delay;
        }
    }

    /// Cancel the owner's deadline, if any. Idempotent.
    pub fn clear(&mut self, owner: TaskId) {
        if let Some(key) = self.keys.remove(&owner) {
            self.queue.try_remove(&key);
        }
        if let Some(record) = self.records.get_mut(&owner) {
            if record.status == TimeoutStatus::Active || record.status == TimeoutStatus::Retrying {
                self.stats.cancelled += 1;
                self.stats.active = self.stats.active.saturating_sub(1);
            }
            record.status = TimeoutStatus::Cancelled;
        }
    }

    /// Cancel every armed deadline.
    pub fn clear_all(&mut self) {
        let owners: Vec<TaskId> = self.keys.keys().copied().collect();
        for owner in owners {
            self.clear(owner);
        }
    }

    /// Mark a deadline as having completed normally (the owning task
    /// finished before the deadline fired). Distinguishes "completed" from
    /// "cancelled" in the stats without changing queue state — callers
    /// should still call [`TimeoutManager::clear`] to remove the timer.
    pub fn mark_completed(&mut self, owner: TaskId) {
        if let Some(record) = self.records.get(&owner) {
            if record.status == TimeoutStatus::Active || record.status == TimeoutStatus::Retrying {
                self.stats.completed += 1;
                self.stats.active = self.stats.active.saturating_sub(1);
            }
        }
        self.clear(owner);
    }

    /// Look up the current record for an owner.
    pub fn get_info(&self, owner: TaskId) -> Option<&TimeoutRecord> {
        self.records.get(&owner)
    }

    /// Snapshot of aggregate counters.
    pub fn get_stats(&self) -> TimeoutStats {
        self.stats.clone()
    }

    /// Await the next deadline to fire, applying retry/backoff bookkeeping
    /// internally and returning the resulting event. Returns `None` only
    /// when no deadlines are armed and none ever will be again (the queue is
    /// empty) — callers in a `tokio::select!` should guard on queue
    /// emptiness themselves if they don't want this branch to pend forever.
    pub async fn next_event(&mut self) -> Option<TimeoutEvent> {
        let expired = self.queue.next().await?;
        let owner = expired.into_inner();
        self.keys.remove(&owner);

        let Some(record) = self.records.get_mut(&owner) else {
            return None;
        };

        match record.retry {
            None => {
                record.status = TimeoutStatus::Fired;
                self.stats.failed += 1;
                self.stats.active = self.stats.active.saturating_sub(1);
                Some(TimeoutEvent::Expired { owner })
            }
            Some(policy) => {
                if record.attempt < policy.max_retries {
                    record.attempt += 1;
                    let attempt = record.attempt;
                    let next_delay = backoff_delay(policy, attempt);

                    let key = self.queue.insert(owner, next_delay);
                    self.keys.insert(owner, key);
                    record.status = TimeoutStatus::Retrying;
                    record.original_delay = next_delay;

                    self.stats.retried += 1;
                    Some(TimeoutEvent::RetryScheduled { owner, attempt, next_delay })
                } else {
                    record.status = TimeoutStatus::Fired;
                    self.stats.failed += 1;
                    self.stats.active = self.stats.active.saturating_sub(1);
                    Some(TimeoutEvent::FinalFailure { owner })
                }
            }
        }
    }

    /// Whether any deadline is currently armed (used to guard the
    /// `next_event` branch of a `select!` so an empty manager doesn't pend
    /// forever on a stream that never yields).
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// `min(max_backoff_delay, base * 2^(attempt - 1) + uniform_jitter(0, max_jitter))`.
///
/// Exposed crate-wide so [`crate::pool::WorkerPool`] can compute a retry
/// delay on demand (after an explicit unit failure or execution-timeout),
/// without needing [`TimeoutManager::set_with_retry`]'s own multi-attempt
/// chaining, which models one deadline spanning several retries rather than
/// one deadline per attempt.
pub(crate) fn backoff_delay(policy: RetryPolicy, attempt: u32) -> Duration {
    let base_ms = policy.initial_delay.as_millis() as u64;
    let exp = attempt.saturating_sub(1).min(32);
    let scaled = base_ms.saturating_mul(1u64 << exp);

    let jitter_ms = if policy.max_jitter.is_zero() {
        0
    } else {
        rand::thread_rng().gen_range(0..=policy.max_jitter.as_millis() as u64)
    };

    let total = scaled.saturating_add(jitter_ms);
    Duration::from_millis(total).min(policy.max_backoff_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(50),
            max_backoff_delay: Duration::from_secs(5),
            max_jitter: Duration::from_millis(10),
        }
    }

    #[test]
    fn set_is_idempotent_for_identical_delay() {
        let mut mgr = TimeoutManager::new();
        let owner = TaskId::new_v4();
        mgr.set(owner, Duration::from_millis(100));
        let created_before = mgr.get_stats().created;
        mgr.set(owner, Duration::from_millis(100));
        assert_eq!(mgr.get_stats().created, created_before);
    }

    #[test]
    fn set_replaces_with_new_delay() {
        let mut mgr = TimeoutManager::new();
        let owner = TaskId::new_v4();
        mgr.set(owner, Duration::from_millis(100));
        mgr.set(owner, Duration::from_millis(200));
        assert_eq!(mgr.get_info(owner).unwrap().original_delay, Duration::from_millis(200));
        assert_eq!(mgr.get_stats().created, 2);
    }

    #[tokio::test]
    async fn retry_then_final_failure() {
        let mut mgr = TimeoutManager::new();
        let owner = TaskId::new_v4();
        mgr.set_with_retry(owner, policy(2));

        let ev1 = mgr.next_event().await.unwrap();
        assert!(matches!(ev1, TimeoutEvent::RetryScheduled { attempt: 1, .. }));

        let ev2 = mgr.next_event().await.unwrap();
        assert!(matches!(ev2, TimeoutEvent::RetryScheduled { attempt: 2, .. }));

        let ev3 = mgr.next_event().await.unwrap();
        assert!(matches!(ev3, TimeoutEvent::FinalFailure { .. }));

        let stats = mgr.get_stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn backoff_is_capped_and_monotonic_without_jitter() {
        let p = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_backoff_delay: Duration::from_secs(1),
            max_jitter: Duration::ZERO,
        };
        let d1 = backoff_delay(p, 1);
        let d2 = backoff_delay(p, 2);
        let d3 = backoff_delay(p, 3);
        assert!(d1 <= d2);
        assert!(d2 <= d3);
        let d_big = backoff_delay(p, 20);
        assert!(d_big <= p.max_backoff_delay);
    }

    #[test]
    fn clear_is_idempotent_on_unknown_owner() {
        let mut mgr = TimeoutManager::new();
        mgr.clear(TaskId::new_v4());
    }

    /// Uses `tokio::time::pause`/`advance`, which manipulates a process-wide
    /// virtual clock — `#[serial]` keeps it from racing other paused-time
    /// tests if any are added alongside this one.
    #[serial_test::serial]
    #[tokio::test]
    async fn expires_exactly_at_the_armed_delay_under_paused_time() {
        tokio::time::pause();
        let mut mgr = TimeoutManager::new();
        let owner = TaskId::new_v4();
        mgr.set(owner, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(mgr.get_info(owner).unwrap().status, TimeoutStatus::Active);

        tokio::time::advance(Duration::from_secs(2)).await;
        let event = mgr.next_event().await.unwrap();
        assert!(matches!(event, TimeoutEvent::Expired { owner: o } if o == owner));
    }
}
