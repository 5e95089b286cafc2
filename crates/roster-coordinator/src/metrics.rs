use roster_observe::metrics::{Counter, Gauge, Timing};
use tracing::info;

/// Process-wide counters shared by every machine of a run.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub machines_started: Counter,
    pub manager_tenures: Counter,
    pub worker_tenures: Counter,
    pub assignments_sent: Counter,
    pub results_recorded: Counter,
    pub duplicate_results: Counter,
    pub results_dropped: Counter,
    pub progress_save_failures: Counter,
    pub active_machines: Gauge,
    pub manager_iteration: Timing,
}

impl CoordinatorMetrics {
    pub fn emit_snapshot(&self) {
        let iteration = self.manager_iteration.snapshot();
        info!(
            target: "roster_metrics",
            machines_started = self.machines_started.get(),
            manager_tenures = self.manager_tenures.get(),
            worker_tenures = self.worker_tenures.get(),
            assignments_sent = self.assignments_sent.get(),
            results_recorded = self.results_recorded.get(),
            duplicate_results = self.duplicate_results.get(),
            results_dropped = self.results_dropped.get(),
            progress_save_failures = self.progress_save_failures.get(),
            active_machines = self.active_machines.get(),
            manager_iterations = iteration.count,
            manager_iteration_mean_us = iteration.mean_us(),
            manager_iteration_max_us = iteration.max_us,
            "metrics"
        );
    }
}
