//! One simulated machine: switches between manager, worker and idle until it "crashes".

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use roster_core::types::{MachineStatus, RunPaths};
use roster_role::{RoleConfig, RoleError, RoleHandle};
use roster_store::LeaseStore;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::channel::Datagram;
use crate::manager::{Manager, ManagerConfig};
use crate::metrics::CoordinatorMetrics;
use crate::progress_store::ProgressStore;
use crate::worker::{Worker, WorkerConfig, Workload};

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub manager_role: RoleConfig,
    pub worker_role: RoleConfig,
    pub manager: ManagerConfig,
    pub worker: WorkerConfig,
    /// Pause between passes when no role could be taken.
    pub idle_backoff: Duration,
    /// Fixed stop time; drawn at random before the run deadline when unset.
    pub termination: Option<Instant>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            manager_role: RoleConfig::with_max_holders(1),
            worker_role: RoleConfig::with_max_holders(5),
            manager: ManagerConfig::default(),
            worker: WorkerConfig::default(),
            idle_backoff: Duration::from_secs(1),
            termination: None,
        }
    }
}

impl MachineConfig {
    /// Time before the stop time below which a pass is not started.
    pub fn deadline_margin(&self) -> Duration {
        self.manager.deadline_margin.min(self.worker.deadline_margin)
    }
}

pub struct Machine {
    status: MachineStatus,
    channel: Arc<dyn Datagram>,
    manager_role: RoleHandle,
    worker_role: RoleHandle,
    progress: ProgressStore,
    workload: Arc<dyn Workload>,
    config: MachineConfig,
    metrics: Arc<CoordinatorMetrics>,
}

impl Machine {
    /// The channel identity doubles as the holder identity for both roles.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        paths: &RunPaths,
        channel: Arc<dyn Datagram>,
        workload: Arc<dyn Workload>,
        config: MachineConfig,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Result<Self, RoleError> {
        let identity = channel.identity().to_string();
        let manager_role = RoleHandle::new(
            Arc::clone(&store),
            paths.manager_role.clone(),
            identity.clone(),
            config.manager_role.clone(),
        )?;
        let worker_role = RoleHandle::new(
            Arc::clone(&store),
            paths.worker_role.clone(),
            identity,
            config.worker_role.clone(),
        )?;
        Ok(Self {
            status: MachineStatus::Started,
            channel,
            manager_role,
            worker_role,
            progress: ProgressStore::new(store, paths.progress.clone()),
            workload,
            config,
            metrics,
        })
    }

    pub fn identity(&self) -> &str {
        self.channel.identity()
    }

    /// Runs until a termination time at or before `deadline`, then stops without releasing
    /// any role.
    pub async fn run(mut self, deadline: Instant) -> MachineStatus {
        let t_end = self
            .config
            .termination
            .unwrap_or_else(|| random_termination(Instant::now(), deadline));
        info!(machine = %self.identity(), "machine started");
        self.run_until(t_end).await;
        info!(machine = %self.identity(), status = %self.status, "machine crashed");
        self.status
    }

    pub async fn run_until(&mut self, t_end: Instant) {
        // Below the loops' own margin a pass would only spin on acquire calls.
        let margin = self.config.deadline_margin();
        while t_end.saturating_duration_since(Instant::now()) > margin {
            if self.manager_role.acquire().await {
                let holders = self.manager_role.active_holders().await;
                self.transition(MachineStatus::Manager, holders.map(|h| h.len()));
                self.metrics.manager_tenures.inc();
                let mut manager = Manager::new(
                    self.manager_role.clone(),
                    self.worker_role.clone(),
                    Arc::clone(&self.channel),
                    self.progress.clone(),
                    self.config.manager.clone(),
                    Arc::clone(&self.metrics),
                );
                let report = manager.run(t_end).await;
                info!(
                    machine = %self.identity(),
                    assigned = report.assigned,
                    "manager pass done"
                );
            } else if self.worker_role.acquire().await {
                let holders = self.worker_role.active_holders().await;
                self.transition(MachineStatus::Worker, holders.map(|h| h.len()));
                self.metrics.worker_tenures.inc();
                let mut worker = Worker::new(
                    self.worker_role.clone(),
                    self.manager_role.clone(),
                    Arc::clone(&self.channel),
                    Arc::clone(&self.workload),
                    self.config.worker.clone(),
                    Arc::clone(&self.metrics),
                );
                let report = worker.run(t_end).await;
                info!(
                    machine = %self.identity(),
                    solved = report.solved,
                    "worker pass done"
                );
            } else {
                self.transition(MachineStatus::Idle, None);
                let remaining = t_end.saturating_duration_since(Instant::now());
                tokio::time::sleep(self.config.idle_backoff.min(remaining)).await;
            }
        }
    }

    fn transition(&mut self, next: MachineStatus, holders: Option<usize>) {
        if self.status == next {
            match next {
                MachineStatus::Idle => debug!(machine = %self.identity(), "still IDLE"),
                _ => info!(machine = %self.identity(), ?holders, "resumes {next}"),
            }
        } else {
            info!(machine = %self.identity(), ?holders, "{} -> {next}", self.status);
            self.status = next;
        }
    }
}

fn random_termination(now: Instant, deadline: Instant) -> Instant {
    let span_ms = deadline.saturating_duration_since(now).as_millis() as u64;
    let offset = rand::thread_rng().gen_range(0..=span_ms);
    now + Duration::from_millis(offset)
}
