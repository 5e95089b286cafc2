use std::collections::BTreeSet;

use roster_core::progress::{AssignPolicy, ProgressRecord};
use roster_core::types::Assignment;

fn workers(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn policy() -> AssignPolicy {
    AssignPolicy {
        chunk_size: 10,
        response_wait_ms: 1_000,
        busy_stale_after_ms: 3_000,
    }
}

#[test]
fn three_idle_workers_get_disjoint_ranges() {
    let mut record = ProgressRecord::default();
    let plan = record.plan_assignments(&workers(&["a", "b", "c"]), 0, &policy());

    assert_eq!(
        plan,
        vec![
            ("a".to_string(), Assignment::new(0, 10)),
            ("b".to_string(), Assignment::new(10, 20)),
            ("c".to_string(), Assignment::new(20, 30)),
        ]
    );
    assert_eq!(record.next, 30);
    assert_eq!(record.pending.len(), 3);

    for (worker, assignment) in plan {
        assert!(record.record_result(&worker, assignment, assignment.len()).recorded);
    }
    assert_eq!(record.finished, 30);
    assert!(record.pending.is_empty());
    assert!(record.busy_workers.is_empty());
    assert_eq!(record.next, 30);
}

#[test]
fn duplicate_reports_are_counted_once() {
    let mut record = ProgressRecord::default();
    let a = Assignment::new(0, 10);
    record.mark_sent("w1", a, 0);
    record.mark_sent("w2", a, 2_000);

    let first = record.record_result("w2", a, 10);
    let second = record.record_result("w2", a, 10);
    let late = record.record_result("w1", a, 10);

    assert!(first.recorded && first.worker_was_busy);
    assert!(!second.recorded && !second.worker_was_busy);
    assert!(!late.recorded);
    assert_eq!(record.finished, 10);
    assert!(record.pending.is_empty());
}

#[test]
fn stalled_range_beats_carving() {
    let mut record = ProgressRecord::default();
    record.plan_assignments(&workers(&["a"]), 0, &policy());
    assert_eq!(record.next, 10);

    // "a" dropped out; its range has stalled by the time "b" shows up.
    let plan = record.plan_assignments(&workers(&["b"]), 1_500, &policy());
    assert_eq!(plan, vec![("b".to_string(), Assignment::new(0, 10))]);
    assert_eq!(record.next, 10, "no new range is carved while a stalled one exists");
    assert_eq!(record.pending_sent_at(&Assignment::new(0, 10)), Some(1_500));
}

#[test]
fn stalled_range_goes_to_one_worker_per_round() {
    let mut record = ProgressRecord::default();
    record.plan_assignments(&workers(&["a"]), 0, &policy());

    // A zero wait makes the range stalled for every lookup in the round.
    let eager = AssignPolicy {
        response_wait_ms: 0,
        ..policy()
    };
    let plan = record.plan_assignments(&workers(&["b", "c", "d"]), 5_000, &eager);

    let mut seen = BTreeSet::new();
    for (_, assignment) in &plan {
        assert!(seen.insert(*assignment), "range {assignment} sent twice");
    }
    assert_eq!(plan[0], ("b".to_string(), Assignment::new(0, 10)));
    assert_eq!(plan[1], ("c".to_string(), Assignment::new(10, 20)));
    assert_eq!(plan[2], ("d".to_string(), Assignment::new(20, 30)));
}

#[test]
fn busy_worker_is_not_reassigned_until_stale() {
    let mut record = ProgressRecord::default();
    let active = workers(&["a"]);
    record.plan_assignments(&active, 0, &policy());

    assert!(record.plan_assignments(&active, 2_000, &policy()).is_empty());

    // Past the busy staleness bound the worker is idle again and gets its stalled range back.
    let plan = record.plan_assignments(&active, 3_500, &policy());
    assert_eq!(plan, vec![("a".to_string(), Assignment::new(0, 10))]);
    assert_eq!(record.next, 10);
}

#[test]
fn each_idle_worker_gets_at_most_one_range() {
    let mut record = ProgressRecord::default();
    let active = workers(&["a", "b"]);
    let plan = record.plan_assignments(&active, 0, &policy());
    assert_eq!(plan.len(), 2);
    assert_eq!(record.busy_workers.len(), 2);
    assert!(record.plan_assignments(&active, 10, &policy()).is_empty());
}
