//! Worker tenure: wait for a range, compute it, report to the current manager.

use std::sync::Arc;
use std::time::Duration;

use roster_core::types::Assignment;
use roster_role::RoleHandle;
use roster_wire::message::{AssignmentMsg, ResultMsg};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::Datagram;
use crate::metrics::CoordinatorMetrics;

/// The work done on one range. Must be a total, deterministic function so a range computed
/// twice yields the same result.
pub trait Workload: Send + Sync {
    fn compute(&self, assignment: Assignment) -> u64;
}

/// Counts the numbers in the range.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountWorkload;

impl Workload for CountWorkload {
    fn compute(&self, assignment: Assignment) -> u64 {
        assignment.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Longest wait for an assignment before the lease is checked again.
    pub recv_timeout: Duration,
    /// Lease time that must remain to wait for, compute and report one range.
    pub lookahead: Duration,
    pub deadline_margin: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_millis(400),
            lookahead: Duration::from_millis(500),
            deadline_margin: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub solved: u64,
    /// Results computed but not sent because the manager was ambiguous.
    pub dropped: u64,
    pub malformed: u64,
}

pub struct Worker {
    role: RoleHandle,
    manager_role: RoleHandle,
    channel: Arc<dyn Datagram>,
    workload: Arc<dyn Workload>,
    config: WorkerConfig,
    metrics: Arc<CoordinatorMetrics>,
    report: WorkerReport,
}

impl Worker {
    /// `role` is the worker lease this tenure runs under; `manager_role` is only read to
    /// find where results go.
    pub fn new(
        role: RoleHandle,
        manager_role: RoleHandle,
        channel: Arc<dyn Datagram>,
        workload: Arc<dyn Workload>,
        config: WorkerConfig,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            role,
            manager_role,
            channel,
            workload,
            config,
            metrics,
            report: WorkerReport::default(),
        }
    }

    pub fn report(&self) -> WorkerReport {
        self.report
    }

    fn identity(&self) -> &str {
        self.channel.identity()
    }

    pub async fn run(&mut self, deadline: Instant) -> WorkerReport {
        while deadline.saturating_duration_since(Instant::now()) > self.config.deadline_margin
            && self.role.is_holding(self.config.lookahead).await
        {
            match self.channel.recv_timeout(self.config.recv_timeout).await {
                Ok(Some(bytes)) => self.handle(&bytes).await,
                Ok(None) => {}
                Err(err) => {
                    warn!(machine = %self.identity(), error = %err, "receive failed");
                    tokio::time::sleep(self.config.recv_timeout).await;
                }
            }
        }
        info!(
            machine = %self.identity(),
            solved = self.report.solved,
            dropped = self.report.dropped,
            "worker tenure ended"
        );
        self.report
    }

    /// Processes one received datagram.
    pub async fn handle(&mut self, bytes: &[u8]) {
        let assignment = match AssignmentMsg::decode(bytes) {
            Ok(msg) => msg.assignment,
            Err(err) => {
                self.report.malformed += 1;
                warn!(machine = %self.identity(), error = %err, "dropping malformed assignment");
                return;
            }
        };
        let count = self.workload.compute(assignment);

        let managers = self.manager_role.active_holders().await.unwrap_or_default();
        let mut holders = managers.iter();
        let (Some(manager), None) = (holders.next(), holders.next()) else {
            self.report.dropped += 1;
            self.metrics.results_dropped.inc();
            warn!(
                machine = %self.identity(),
                managers = managers.len(),
                lower = assignment.lower,
                higher = assignment.higher,
                "expected exactly one manager; result dropped"
            );
            return;
        };

        let result = ResultMsg {
            assignment,
            count,
            worker: self.identity().to_string(),
        };
        match self.channel.send_to(manager, &result.encode()).await {
            Ok(()) => {
                self.report.solved += 1;
                debug!(
                    machine = %self.identity(),
                    manager = %manager,
                    lower = assignment.lower,
                    higher = assignment.higher,
                    count,
                    "result sent"
                );
            }
            Err(err) => {
                self.report.dropped += 1;
                self.metrics.results_dropped.inc();
                warn!(machine = %self.identity(), manager = %manager, error = %err, "result send failed");
            }
        }
    }
}
