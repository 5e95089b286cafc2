//! In-memory form of the progress record kept by whichever machine holds the manager role.
//!
//! Invariants:
//! - `next` never decreases; every carved range starts at the previous `next`.
//! - a range appears at most once in `pending`, which keeps insertion order.
//! - a range leaves `pending` only when its count is added to `finished`, so duplicate
//!   reports for the same range are counted once.
//! - a worker is busy with at most one range.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::Assignment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub assignment: Assignment,
    pub sent_unix_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressRecord {
    pub next: u64,
    pub pending: Vec<PendingEntry>,
    pub busy_workers: BTreeMap<String, Assignment>,
    pub finished: u64,
}

/// Knobs for one round of assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignPolicy {
    pub chunk_size: u64,
    /// A pending range last sent longer ago than this is considered stalled and may be
    /// reassigned.
    pub response_wait_ms: u64,
    /// A busy worker whose range was last sent longer ago than this is considered idle
    /// again.
    pub busy_stale_after_ms: u64,
}

/// What happened when a result was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultOutcome {
    /// The count was added to `finished`.
    pub recorded: bool,
    /// The reporting worker was tracked as busy with the reported range.
    pub worker_was_busy: bool,
}

impl ProgressRecord {
    pub fn is_pending(&self, assignment: &Assignment) -> bool {
        self.pending_index(assignment).is_some()
    }

    pub fn pending_sent_at(&self, assignment: &Assignment) -> Option<u64> {
        self.pending_index(assignment)
            .map(|idx| self.pending[idx].sent_unix_time_ms)
    }

    fn pending_index(&self, assignment: &Assignment) -> Option<usize> {
        self.pending
            .iter()
            .position(|entry| entry.assignment == *assignment)
    }

    /// Records a completion report. Idempotent per range.
    pub fn record_result(&mut self, worker: &str, assignment: Assignment, count: u64) -> ResultOutcome {
        let worker_was_busy = self.busy_workers.get(worker) == Some(&assignment);
        if worker_was_busy {
            self.busy_workers.remove(worker);
        }

        let recorded = match self.pending_index(&assignment) {
            Some(idx) => {
                self.pending.remove(idx);
                self.finished = self.finished.saturating_add(count);
                true
            }
            None => false,
        };

        ResultOutcome {
            recorded,
            worker_was_busy,
        }
    }

    /// Drops busy entries that no longer block a worker: the worker left the worker role,
    /// its range completed through someone else, or the range was last sent too long ago.
    ///
    /// Returns the workers that were released.
    pub fn prune_busy(
        &mut self,
        active_workers: &BTreeSet<String>,
        now_ms: u64,
        busy_stale_after_ms: u64,
    ) -> Vec<String> {
        let mut released = Vec::new();
        let pending = &self.pending;
        self.busy_workers.retain(|worker, assignment| {
            let keep = active_workers.contains(worker)
                && pending.iter().any(|entry| {
                    entry.assignment == *assignment
                        && entry.sent_unix_time_ms.saturating_add(busy_stale_after_ms) >= now_ms
                });
            if !keep {
                released.push(worker.clone());
            }
            keep
        });
        released
    }

    /// Active workers without a recorded assignment, in identity order.
    pub fn idle_workers(&self, active_workers: &BTreeSet<String>) -> Vec<String> {
        active_workers
            .iter()
            .filter(|worker| !self.busy_workers.contains_key(*worker))
            .cloned()
            .collect()
    }

    /// First pending range (in insertion order) whose last send is older than
    /// `response_wait_ms`, skipping ranges in `exclude`.
    pub fn stalled(
        &self,
        now_ms: u64,
        response_wait_ms: u64,
        exclude: &BTreeSet<Assignment>,
    ) -> Option<Assignment> {
        self.pending
            .iter()
            .find(|entry| {
                entry.sent_unix_time_ms.saturating_add(response_wait_ms) < now_ms
                    && !exclude.contains(&entry.assignment)
            })
            .map(|entry| entry.assignment)
    }

    /// Carves a fresh range at the frontier and advances `next`.
    pub fn carve(&mut self, chunk_size: u64) -> Assignment {
        let lower = self.next;
        let higher = lower.saturating_add(chunk_size.max(1));
        self.next = higher;
        Assignment { lower, higher }
    }

    /// Records that `assignment` was handed to `worker` at `now_ms`.
    ///
    /// A reassigned range keeps its position in `pending` and gets a fresh timestamp; any
    /// other worker still recorded busy with it is released.
    pub fn mark_sent(&mut self, worker: &str, assignment: Assignment, now_ms: u64) {
        match self.pending_index(&assignment) {
            Some(idx) => self.pending[idx].sent_unix_time_ms = now_ms,
            None => self.pending.push(PendingEntry {
                assignment,
                sent_unix_time_ms: now_ms,
            }),
        }
        if assignment.higher > self.next {
            self.next = assignment.higher;
        }
        self.busy_workers
            .retain(|other, busy| other == worker || *busy != assignment);
        self.busy_workers.insert(worker.to_string(), assignment);
    }

    /// One assignment round: release stale busy entries, then give every idle worker
    /// exactly one range, preferring stalled ranges over carving new ones. A range is
    /// handed to at most one worker per round.
    pub fn plan_assignments(
        &mut self,
        active_workers: &BTreeSet<String>,
        now_ms: u64,
        policy: &AssignPolicy,
    ) -> Vec<(String, Assignment)> {
        self.prune_busy(active_workers, now_ms, policy.busy_stale_after_ms);

        let mut sent_this_round = BTreeSet::new();
        let mut plan = Vec::new();
        for worker in self.idle_workers(active_workers) {
            let assignment = match self.stalled(now_ms, policy.response_wait_ms, &sent_this_round) {
                Some(stalled) => stalled,
                None => self.carve(policy.chunk_size),
            };
            self.mark_sent(&worker, assignment, now_ms);
            sent_this_round.insert(assignment);
            plan.push((worker, assignment));
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AssignPolicy {
        AssignPolicy {
            chunk_size: 10,
            response_wait_ms: 1_000,
            busy_stale_after_ms: 3_000,
        }
    }

    #[test]
    fn carve_advances_frontier() {
        let mut record = ProgressRecord::default();
        assert_eq!(record.carve(10), Assignment::new(0, 10));
        assert_eq!(record.carve(10), Assignment::new(10, 20));
        assert_eq!(record.next, 20);
    }

    #[test]
    fn reassignment_keeps_pending_position() {
        let mut record = ProgressRecord::default();
        let a = Assignment::new(0, 10);
        let b = Assignment::new(10, 20);
        record.mark_sent("w1", a, 100);
        record.mark_sent("w2", b, 200);
        record.mark_sent("w3", a, 5_000);

        assert_eq!(record.pending[0].assignment, a);
        assert_eq!(record.pending[0].sent_unix_time_ms, 5_000);
        assert_eq!(record.pending.len(), 2);
        assert!(!record.busy_workers.contains_key("w1"));
        assert_eq!(record.busy_workers.get("w3"), Some(&a));
        assert_eq!(record.next, 20);
    }

    #[test]
    fn report_for_other_range_keeps_worker_busy() {
        let mut record = ProgressRecord::default();
        record.mark_sent("w1", Assignment::new(0, 10), 0);
        record.mark_sent("w1", Assignment::new(10, 20), 10);

        let outcome = record.record_result("w1", Assignment::new(0, 10), 10);
        assert!(outcome.recorded);
        assert!(!outcome.worker_was_busy);
        assert_eq!(record.busy_workers.get("w1"), Some(&Assignment::new(10, 20)));
    }

    #[test]
    fn prune_releases_departed_and_stale_workers() {
        let mut record = ProgressRecord::default();
        record.mark_sent("gone", Assignment::new(0, 10), 10_000);
        record.mark_sent("stale", Assignment::new(10, 20), 1_000);
        record.mark_sent("fresh", Assignment::new(20, 30), 9_500);

        let active: BTreeSet<String> = ["stale", "fresh"].iter().map(|s| s.to_string()).collect();
        let mut released = record.prune_busy(&active, 10_000, policy().busy_stale_after_ms);
        released.sort();

        assert_eq!(released, vec!["gone".to_string(), "stale".to_string()]);
        assert_eq!(record.busy_workers.len(), 1);
        assert!(record.busy_workers.contains_key("fresh"));
        // Pruning never touches pending.
        assert_eq!(record.pending.len(), 3);
    }
}
