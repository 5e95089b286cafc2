//! Manager tenure: hand out ranges to idle workers and account for their results.

use std::sync::Arc;
use std::time::Duration;

use roster_core::progress::{AssignPolicy, ProgressRecord};
use roster_core::types::unix_time_ms;
use roster_role::RoleHandle;
use roster_wire::message::{AssignmentMsg, ResultMsg};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::Datagram;
use crate::metrics::CoordinatorMetrics;
use crate::progress_store::{ProgressLoad, ProgressStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub chunk_size: u64,
    /// A pending range unanswered for this long is handed to another worker.
    pub response_wait: Duration,
    /// A worker busy with a range sent this long ago counts as idle again.
    pub busy_stale_after: Duration,
    /// Lease time that must remain to start another iteration.
    pub iteration_lookahead: Duration,
    pub deadline_margin: Duration,
    pub idle_pause: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            response_wait: Duration::from_secs(1),
            busy_stale_after: Duration::from_secs(3),
            iteration_lookahead: Duration::from_millis(500),
            deadline_margin: Duration::from_millis(500),
            idle_pause: Duration::from_millis(50),
        }
    }
}

impl ManagerConfig {
    pub fn policy(&self) -> AssignPolicy {
        AssignPolicy {
            chunk_size: self.chunk_size.max(1),
            response_wait_ms: self.response_wait.as_millis() as u64,
            busy_stale_after_ms: self.busy_stale_after.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerReport {
    pub iterations: u64,
    pub assigned: u64,
    pub recorded: u64,
    pub duplicate_reports: u64,
}

pub struct Manager {
    role: RoleHandle,
    workers: RoleHandle,
    channel: Arc<dyn Datagram>,
    progress: ProgressStore,
    config: ManagerConfig,
    metrics: Arc<CoordinatorMetrics>,
    record: ProgressRecord,
    /// Set once `record` is known to match the store; nothing is saved before that.
    synced: bool,
    report: ManagerReport,
}

impl Manager {
    /// `role` is the manager lease this tenure runs under; `workers` is only read for its
    /// holders.
    pub fn new(
        role: RoleHandle,
        workers: RoleHandle,
        channel: Arc<dyn Datagram>,
        progress: ProgressStore,
        config: ManagerConfig,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            role,
            workers,
            channel,
            progress,
            config,
            metrics,
            record: ProgressRecord::default(),
            synced: false,
            report: ManagerReport::default(),
        }
    }

    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }

    pub fn report(&self) -> ManagerReport {
        self.report
    }

    fn identity(&self) -> &str {
        self.channel.identity()
    }

    pub async fn load(&mut self) -> ProgressLoad {
        let loaded = self.progress.load(&mut self.record).await;
        match loaded {
            ProgressLoad::Loaded => info!(
                machine = %self.identity(),
                next = self.record.next,
                pending = self.record.pending.len(),
                finished = self.record.finished,
                "resuming saved progress"
            ),
            ProgressLoad::Absent => info!(machine = %self.identity(), "starting fresh progress"),
            ProgressLoad::Failed => {
                warn!(machine = %self.identity(), "saved progress unavailable; not saving")
            }
        }
        self.synced = loaded.is_synced();
        loaded
    }

    /// Records every result already queued on the channel. Never blocks.
    pub async fn drain_results(&mut self) -> u64 {
        let mut drained = 0;
        loop {
            let bytes = match self.channel.try_recv().await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(err) => {
                    warn!(machine = %self.identity(), error = %err, "receive failed");
                    break;
                }
            };
            drained += 1;

            let msg = match ResultMsg::decode(&bytes) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(machine = %self.identity(), error = %err, "dropping malformed result");
                    continue;
                }
            };

            let outcome = self
                .record
                .record_result(&msg.worker, msg.assignment, msg.count);
            if !outcome.worker_was_busy {
                debug!(
                    machine = %self.identity(),
                    worker = %msg.worker,
                    lower = msg.assignment.lower,
                    higher = msg.assignment.higher,
                    "result from a worker not tracked as busy with it"
                );
            }
            if outcome.recorded {
                self.report.recorded += 1;
                self.metrics.results_recorded.inc();
                debug!(
                    machine = %self.identity(),
                    worker = %msg.worker,
                    lower = msg.assignment.lower,
                    higher = msg.assignment.higher,
                    count = msg.count,
                    "result recorded"
                );
            } else {
                self.report.duplicate_reports += 1;
                self.metrics.duplicate_results.inc();
                debug!(
                    machine = %self.identity(),
                    lower = msg.assignment.lower,
                    higher = msg.assignment.higher,
                    "duplicate result ignored"
                );
            }
        }
        drained
    }

    /// Gives each idle worker one range. Skipped when the worker role cannot be read, so
    /// a store hiccup never makes every worker look departed.
    pub async fn assign_idle_workers(&mut self) -> u64 {
        let Some(active) = self.workers.active_holders().await else {
            debug!(machine = %self.identity(), "worker role unreadable; skipping assignment");
            return 0;
        };

        let plan = self
            .record
            .plan_assignments(&active, unix_time_ms(), &self.config.policy());
        for (worker, assignment) in &plan {
            let payload = AssignmentMsg {
                assignment: *assignment,
            }
            .encode();
            // The range is already pending; a lost send is recovered by reassignment.
            if let Err(err) = self.channel.send_to(worker, &payload).await {
                warn!(
                    machine = %self.identity(),
                    worker = %worker,
                    lower = assignment.lower,
                    higher = assignment.higher,
                    error = %err,
                    "assignment send failed"
                );
            }
            self.metrics.assignments_sent.inc();
            debug!(
                machine = %self.identity(),
                worker = %worker,
                lower = assignment.lower,
                higher = assignment.higher,
                "assigned"
            );
        }
        let assigned = plan.len() as u64;
        self.report.assigned += assigned;
        assigned
    }

    /// Writes the record. Refused until a load has either read the snapshot or found none.
    pub async fn save(&mut self) -> bool {
        if !self.synced {
            debug!(machine = %self.identity(), "progress not loaded; save skipped");
            return false;
        }
        let saved = self.progress.save(&self.record).await;
        if !saved {
            self.metrics.progress_save_failures.inc();
        }
        saved
    }

    /// Loads progress first if that has not succeeded yet; the iteration is skipped while it
    /// keeps failing.
    pub async fn run_iteration(&mut self) {
        if !self.synced && !self.load().await.is_synced() {
            return;
        }
        let metrics = Arc::clone(&self.metrics);
        let _timing = metrics.manager_iteration.start();
        self.drain_results().await;
        self.assign_idle_workers().await;
        self.save().await;
        self.report.iterations += 1;
    }

    /// Runs iterations while the manager lease will outlast one more of them and the
    /// deadline is not within the safety margin.
    pub async fn run(&mut self, deadline: Instant) -> ManagerReport {
        while deadline.saturating_duration_since(Instant::now()) > self.config.deadline_margin
            && self.role.is_holding(self.config.iteration_lookahead).await
        {
            self.run_iteration().await;
            tokio::time::sleep(self.config.idle_pause).await;
        }
        info!(
            machine = %self.identity(),
            iterations = self.report.iterations,
            assigned = self.report.assigned,
            recorded = self.report.recorded,
            finished = self.record.finished,
            "manager tenure ended"
        );
        self.report
    }
}
