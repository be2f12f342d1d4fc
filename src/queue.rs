//! TaskQueue: a priority queue of pending tasks, FIFO within priority.
//!
//! A binary-heap ordering on priority first, then submission sequence,
//! holding a plain [`crate::task::Task`] rather than a task-plus-response-
//! channel tuple — the response channel lives in [`crate::pool::WorkerPool`]
//! instead, since the queue here is a pure data structure with no async
//! behavior of its own.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::task::{Task, TaskId};

/// Monotonically increasing counter used to break priority ties in
/// submission order without depending on wall-clock resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Sequence(u64);

#[derive(Debug)]
struct Entry {
    task: Task,
    sequence: Sequence,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.task.id == other.task.id
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; Priority::High = 0 must sort "greatest",
        // so priority compares in reverse, and sequence compares in reverse
        // too (earlier sequence = dequeued first = "greater").
        other.task.priority.cmp(&self.task.priority).then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of pending tasks: highest priority first, earliest
/// submission first within a priority level.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
}

impl TaskQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), next_sequence: 0 }
    }

    /// Add a task to the queue.
    pub fn enqueue(&mut self, task: Task) {
        let sequence = Sequence(self.next_sequence);
        self.next_sequence += 1;
        self.heap.push(Entry { task, sequence });
    }

    /// Remove and return the highest-priority, earliest-submitted task, or
    /// `None` if the queue is empty.
    pub fn dequeue(&mut self) -> Option<Task> {
        self.heap.pop().map(|entry| entry.task)
    }

    /// Remove a task by id regardless of its position. `O(n)`.
    pub fn remove(&mut self, id: TaskId) -> bool {
        let before = self.heap.len();
        let remaining: Vec<Entry> = self.heap.drain().filter(|entry| entry.task.id != id).collect();
        let found = remaining.len() != before;
        self.heap = remaining.into_iter().collect();
        found
    }

    /// Number of pending tasks.
    pub fn size(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// A snapshot of all pending tasks, in arbitrary order.
    pub fn get_all(&self) -> Vec<Task> {
        self.heap.iter().map(|entry| entry.task.clone()).collect()
    }

    /// Discard every pending task.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, TaskOptions};
    use serde_json::json;

    fn task(priority: Priority) -> Task {
        let mut t = Task::new("test", "calc", json!({}), TaskOptions::default());
        t.priority = priority;
        t
    }

    #[test]
    fn priority_preempts_queue() {
        let mut q = TaskQueue::new();
        let a = task(Priority::Low);
        let b = task(Priority::High);
        let c = task(Priority::Normal);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        q.enqueue(a);
        q.enqueue(b);
        q.enqueue(c);

        assert_eq!(q.dequeue().unwrap().id, b_id);
        assert_eq!(q.dequeue().unwrap().id, c_id);
        assert_eq!(q.dequeue().unwrap().id, a_id);
    }

    #[test]
    fn fifo_within_priority() {
        let mut q = TaskQueue::new();
        let ids: Vec<TaskId> = (0..5)
            .map(|_| {
                let t = task(Priority::Normal);
                let id = t.id;
                q.enqueue(t);
                id
            })
            .collect();

        for expected in ids {
            assert_eq!(q.dequeue().unwrap().id, expected);
        }
    }

    #[test]
    fn remove_by_id() {
        let mut q = TaskQueue::new();
        let a = task(Priority::Normal);
        let id = a.id;
        q.enqueue(a);
        assert!(q.remove(id));
        assert!(!q.remove(id));
        assert!(q.is_empty());
    }

    #[test]
    fn dequeue_on_empty_is_none() {
        let mut q = TaskQueue::new();
        assert!(q.dequeue().is_none());
    }

    proptest::proptest! {
        /// For any interleaving of priorities, dequeue order is non-decreasing
        /// in `Priority`'s ordinal (High=0 first) and FIFO within a tied
        /// priority, regardless of how the three priorities are shuffled in.
        #[test]
        fn dequeue_order_matches_priority_then_submission(priorities in proptest::collection::vec(0u8..3, 0..64)) {
            let mut q = TaskQueue::new();
            let mut submitted = Vec::new();
            for p in &priorities {
                let priority = match p {
                    0 => Priority::High,
                    1 => Priority::Normal,
                    _ => Priority::Low,
                };
                let t = task(priority);
                submitted.push((t.id, priority, submitted.len()));
                q.enqueue(t);
            }

            let mut expected = submitted.clone();
            expected.sort_by_key(|(_, priority, order)| (*priority, *order));

            let mut dequeued = Vec::new();
            while let Some(t) = q.dequeue() {
                dequeued.push(t.id);
            }
            let expected_ids: Vec<TaskId> = expected.into_iter().map(|(id, _, _)| id).collect();
            proptest::prop_assert_eq!(dequeued, expected_ids);
        }
    }
}
