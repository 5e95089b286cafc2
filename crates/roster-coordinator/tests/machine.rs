use std::sync::Arc;
use std::time::Duration;

use roster_coordinator::channel::Datagram;
use roster_coordinator::{
    CoordinatorMetrics, CountWorkload, Machine, MachineConfig, ManagerConfig, MemNetwork,
    ProgressLoad, ProgressStore, WorkerConfig,
};
use roster_core::progress::ProgressRecord;
use roster_core::types::{MachineStatus, RunId, RunPaths};
use roster_role::RoleConfig;
use roster_store::mem::MemLeaseStore;
use roster_store::LeaseStore;
use tokio::time::Instant;

fn role_config(max_holders: u32) -> RoleConfig {
    RoleConfig {
        playtime: Duration::from_millis(400),
        max_holders,
        renew_margin: Duration::from_millis(100),
        renew_retries: 1,
        renew_retry_interval: Duration::from_millis(50),
    }
}

fn machine_config(workers: u32, stop_in: Duration) -> MachineConfig {
    MachineConfig {
        manager_role: role_config(1),
        worker_role: role_config(workers),
        manager: ManagerConfig {
            chunk_size: 10,
            response_wait: Duration::from_millis(100),
            busy_stale_after: Duration::from_millis(300),
            iteration_lookahead: Duration::from_millis(100),
            deadline_margin: Duration::from_millis(100),
            idle_pause: Duration::from_millis(10),
        },
        worker: WorkerConfig {
            recv_timeout: Duration::from_millis(80),
            lookahead: Duration::from_millis(100),
            deadline_margin: Duration::from_millis(100),
        },
        idle_backoff: Duration::from_millis(50),
        termination: Some(Instant::now() + stop_in),
    }
}

struct Harness {
    store: Arc<MemLeaseStore>,
    net: MemNetwork,
    paths: RunPaths,
    metrics: Arc<CoordinatorMetrics>,
}

impl Harness {
    fn new(run: &str) -> Self {
        Self {
            store: Arc::new(MemLeaseStore::default()),
            net: MemNetwork::new(),
            paths: RunId::parse(run).unwrap().paths(),
            metrics: Arc::new(CoordinatorMetrics::default()),
        }
    }

    /// Runs one machine to its pinned stop time; returns its identity and final status.
    async fn run_machine(&self, config: MachineConfig) -> (String, MachineStatus) {
        let channel: Arc<dyn Datagram> = Arc::new(self.net.bind_channel().unwrap());
        let identity = channel.identity().to_string();
        let machine = Machine::new(
            self.store.clone(),
            &self.paths,
            channel,
            Arc::new(CountWorkload),
            config,
            self.metrics.clone(),
        )
        .unwrap();

        let started = Instant::now();
        // The pinned termination wins over this deadline.
        let status = machine.run(started + Duration::from_secs(30)).await;
        assert!(started.elapsed() < Duration::from_millis(1_200));
        (identity, status)
    }

    async fn holders(&self, role_path: &str) -> anyhow::Result<Vec<String>> {
        let read = self.store.read_role(role_path).await?;
        Ok(read.active_holders().into_iter().collect())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn free_manager_role_is_taken_first_and_kept_after_stop() -> anyhow::Result<()> {
    let h = Harness::new("machine_manager");
    let (identity, status) = h
        .run_machine(machine_config(3, Duration::from_millis(700)))
        .await;

    assert_eq!(status, MachineStatus::Manager);
    assert!(h.metrics.manager_tenures.get() >= 1);
    assert_eq!(h.metrics.worker_tenures.get(), 0);

    // Stopped without releasing.
    assert_eq!(h.holders(&h.paths.manager_role).await?, vec![identity]);
    assert!(h.holders(&h.paths.worker_role).await?.is_empty());

    let mut record = ProgressRecord::default();
    let progress = ProgressStore::new(h.store.clone(), h.paths.progress.clone());
    assert_eq!(progress.load(&mut record).await, ProgressLoad::Loaded);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn taken_manager_role_makes_a_worker() -> anyhow::Result<()> {
    let h = Harness::new("machine_worker");
    h.store
        .take_role(&h.paths.manager_role, "other", Duration::from_secs(10), 1)
        .await?;

    let (identity, status) = h
        .run_machine(machine_config(3, Duration::from_millis(700)))
        .await;

    assert_eq!(status, MachineStatus::Worker);
    assert_eq!(h.metrics.manager_tenures.get(), 0);
    assert!(h.metrics.worker_tenures.get() >= 1);
    assert_eq!(h.holders(&h.paths.manager_role).await?, vec!["other".to_string()]);
    assert_eq!(h.holders(&h.paths.worker_role).await?, vec![identity]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_roles_leave_the_machine_idle() -> anyhow::Result<()> {
    let h = Harness::new("machine_idle");
    h.store
        .take_role(&h.paths.manager_role, "other", Duration::from_secs(10), 1)
        .await?;
    h.store
        .take_role(&h.paths.worker_role, "busy", Duration::from_secs(10), 1)
        .await?;

    let (identity, status) = h
        .run_machine(machine_config(1, Duration::from_millis(400)))
        .await;

    assert_eq!(status, MachineStatus::Idle);
    assert_eq!(h.metrics.manager_tenures.get(), 0);
    assert_eq!(h.metrics.worker_tenures.get(), 0);
    let workers = h.holders(&h.paths.worker_role).await?;
    assert_eq!(workers, vec!["busy".to_string()]);
    assert!(!workers.contains(&identity));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_time_inside_the_margin_runs_no_pass() {
    let h = Harness::new("machine_no_pass");
    let (_, status) = h
        .run_machine(machine_config(3, Duration::from_millis(50)))
        .await;

    assert_eq!(status, MachineStatus::Started);
    assert_eq!(h.metrics.manager_tenures.get(), 0);
    assert_eq!(h.metrics.worker_tenures.get(), 0);
}
