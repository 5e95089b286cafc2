//! Keeps a fixed pool of machines alive for the length of a run.

use std::sync::Arc;
use std::time::Duration;

use roster_core::types::RunId;
use roster_store::LeaseStore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

use crate::channel::ChannelFactory;
use crate::machine::{Machine, MachineConfig};
use crate::metrics::CoordinatorMetrics;
use crate::worker::Workload;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub pool_size: usize,
    pub machine: MachineConfig,
    /// Wait before retrying after a machine could not be built.
    pub rebuild_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let machine = MachineConfig::default();
        // Every worker slot, one manager, two spares.
        let pool_size = machine.worker_role.max_holders as usize + 1 + 2;
        Self {
            pool_size,
            machine,
            rebuild_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub machines_started: u64,
}

pub struct Supervisor {
    run_id: RunId,
    store: Arc<dyn LeaseStore>,
    channels: Arc<dyn ChannelFactory>,
    workload: Arc<dyn Workload>,
    config: SupervisorConfig,
    metrics: Arc<CoordinatorMetrics>,
}

impl Supervisor {
    pub fn new(
        run_id: RunId,
        store: Arc<dyn LeaseStore>,
        channels: Arc<dyn ChannelFactory>,
        workload: Arc<dyn Workload>,
        config: SupervisorConfig,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            run_id,
            store,
            channels,
            workload,
            config,
            metrics,
        }
    }

    /// Runs one babysitter per pool slot until `deadline`; each replaces its machine
    /// whenever the previous one stops.
    pub async fn run(&self, deadline: Instant) -> SupervisorReport {
        let span = info_span!("supervisor", run_id = %self.run_id);
        async move {
            info!(pool_size = self.config.pool_size, "starting machine pool");
            let mut sitters = JoinSet::new();
            for slot in 0..self.config.pool_size {
                sitters.spawn(
                    babysit(
                        self.run_id.clone(),
                        Arc::clone(&self.store),
                        Arc::clone(&self.channels),
                        Arc::clone(&self.workload),
                        self.config.clone(),
                        Arc::clone(&self.metrics),
                        deadline,
                    )
                    .instrument(info_span!("slot", slot)),
                );
            }

            let mut report = SupervisorReport::default();
            while let Some(joined) = sitters.join_next().await {
                match joined {
                    Ok(started) => report.machines_started += started,
                    Err(err) => warn!(error = %err, "babysitter task failed"),
                }
            }
            info!(machines_started = report.machines_started, "machine pool stopped");
            report
        }
        .instrument(span)
        .await
    }
}

async fn babysit(
    run_id: RunId,
    store: Arc<dyn LeaseStore>,
    channels: Arc<dyn ChannelFactory>,
    workload: Arc<dyn Workload>,
    config: SupervisorConfig,
    metrics: Arc<CoordinatorMetrics>,
    deadline: Instant,
) -> u64 {
    let paths = run_id.paths();
    // Each replacement draws its own stop time.
    let machine_config = MachineConfig {
        termination: None,
        ..config.machine.clone()
    };
    let mut started = 0;
    // A machine built inside the margin would stop at once.
    let margin = config.machine.deadline_margin();
    while deadline.saturating_duration_since(Instant::now()) > margin {
        let channel = match channels.bind().await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(error = %err, "channel bind failed");
                tokio::time::sleep(config.rebuild_backoff).await;
                continue;
            }
        };
        let machine = match Machine::new(
            Arc::clone(&store),
            &paths,
            channel,
            Arc::clone(&workload),
            machine_config.clone(),
            Arc::clone(&metrics),
        ) {
            Ok(machine) => machine,
            Err(err) => {
                warn!(error = %err, "machine could not be built");
                tokio::time::sleep(config.rebuild_backoff).await;
                continue;
            }
        };

        started += 1;
        metrics.machines_started.inc();
        metrics.active_machines.inc();
        machine.run(deadline).await;
        metrics.active_machines.dec();
    }
    started
}
