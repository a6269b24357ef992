//! The waiting-set ordering structure: a priority-then-FIFO multiset of queued [`crate::run::Run`]s.
//!
//! The [`PriorityQueue`] never owns a `Run` long-term — it is consulted once per
//! dispatch pass by [`crate::scheduler::Scheduler`], which is the only component
//! allowed to mutate a `Run`'s lifecycle fields. Ordering key: `(priority DESC,
//! created_at ASC)`, tie-broken by `run_id` for determinism.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::run::Run;

/// Newtype wrapping a [`Run`] with the ordering the waiting set needs.
///
/// `BinaryHeap` is a max-heap, so `Ord` here is defined so that "greatest"
/// means "should be dispatched first": higher `priority` wins; ties broken by
/// earlier `created_at` (FIFO); further ties broken by `run_id` so the order is
/// fully deterministic even with identical timestamps.
#[derive(Debug, Clone)]
struct QueueEntry(Run);

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.created_at.cmp(&self.0.created_at))
            .then_with(|| other.0.run_id.cmp(&self.0.run_id))
    }
}

/// An ordered multiset of waiting [`Run`]s, keyed by `(priority DESC, created_at ASC)`.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl PriorityQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert a `Run` into the waiting set. O(log n).
    pub fn push(&mut self, run: Run) {
        self.heap.push(QueueEntry(run));
    }

    /// Remove and return the highest-ordered `Run` for which `predicate` holds.
    ///
    /// Runs examined-then-skipped are pushed back so the queue's contents are
    /// unchanged except for the one removed element (if any). This is the
    /// operation the dispatch loop uses: a higher-priority run blocked on its
    /// per-agent cap must not starve a lower-priority run from another agent.
    pub fn pop_if(&mut self, mut predicate: impl FnMut(&Run) -> bool) -> Option<Run> {
        let mut skipped = Vec::new();
        let found = loop {
            match self.heap.pop() {
                None => break None,
                Some(entry) => {
                    if predicate(&entry.0) {
                        break Some(entry.0);
                    }
                    skipped.push(entry);
                }
            }
        };
        for entry in skipped {
            self.heap.push(entry);
        }
        found
    }

    /// Remove a specific `Run` by id, for cancelling a still-queued run. O(n).
    pub fn remove(&mut self, run_id: &str) -> bool {
        let before = self.heap.len();
        let remaining: Vec<QueueEntry> = self
            .heap
            .drain()
            .filter(|entry| entry.0.run_id != run_id)
            .collect();
        let removed = remaining.len() != before;
        self.heap = remaining.into_iter().collect();
        removed
    }

    /// Read-only snapshot in dispatch order; does not mutate the queue.
    #[must_use]
    pub fn peek_all(&self) -> Vec<Run> {
        let mut entries: Vec<&QueueEntry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.0.clone()).collect()
    }

    /// Drain every waiting run, e.g. for `clear_queue`.
    pub fn drain_all(&mut self) -> Vec<Run> {
        self.heap.drain().map(|e| e.0).collect()
    }
}
