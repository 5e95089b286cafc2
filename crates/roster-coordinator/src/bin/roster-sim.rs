#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::Instant;
use tracing::{info, info_span, Instrument};

use roster_coordinator::{
    CoordinatorMetrics, CountWorkload, MachineConfig, ManagerConfig, ProgressLoad, ProgressStore,
    Supervisor, SupervisorConfig, UdpFactory,
};
use roster_core::progress::ProgressRecord;
use roster_core::types::RunId;
use roster_role::RoleConfig;
use roster_store::mem::{MemLeaseStore, MemStoreConfig};
use roster_store::LeaseStore;

#[derive(Debug, Parser)]
#[command(name = "roster-sim")]
struct Args {
    /// How long the machine pool runs.
    #[arg(long, env = "ROSTER_RUN_SECS", default_value_t = 20)]
    run_secs: u64,

    /// Worker role slots.
    #[arg(long, env = "ROSTER_WORKERS", default_value_t = 5)]
    workers: u32,

    /// Machines beyond one manager and the worker slots, to take over after crashes.
    #[arg(long, env = "ROSTER_SPARE_MACHINES", default_value_t = 2)]
    spare_machines: usize,

    #[arg(long, env = "ROSTER_CHUNK_SIZE", default_value_t = 1000)]
    chunk_size: u64,

    /// How long an assigned range may go unanswered before it is reassigned.
    #[arg(long, env = "ROSTER_RESULT_WAIT_MS", default_value_t = 1000)]
    result_wait_ms: u64,

    /// Lease duration requested for both roles.
    #[arg(long, env = "ROSTER_PLAYTIME_SECS", default_value_t = 10)]
    playtime_secs: u64,

    /// Run identifier; all paths live under /manager_workers/<run-id>. Random when unset.
    #[arg(long, env = "ROSTER_RUN_ID")]
    run_id: Option<String>,

    /// Optional: periodically emit a metrics snapshot to logs.
    #[arg(long, env = "ROSTER_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 0)]
    metrics_snapshot_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    roster_observe::logging::init_tracing();

    let args = Args::parse();
    if args.workers == 0 {
        anyhow::bail!("ROSTER_WORKERS must be > 0");
    }

    let run_id = match &args.run_id {
        Some(raw) => RunId::parse(raw).context("invalid --run-id")?,
        None => RunId(uuid::Uuid::new_v4().to_string().replace('-', "_")),
    };

    let playtime = Duration::from_secs(args.playtime_secs);
    let response_wait = Duration::from_millis(args.result_wait_ms);
    let machine = MachineConfig {
        manager_role: RoleConfig {
            playtime,
            ..RoleConfig::with_max_holders(1)
        },
        worker_role: RoleConfig {
            playtime,
            ..RoleConfig::with_max_holders(args.workers)
        },
        manager: ManagerConfig {
            chunk_size: args.chunk_size,
            response_wait,
            busy_stale_after: response_wait * 3,
            ..Default::default()
        },
        ..Default::default()
    };
    machine.manager_role.validate()?;
    machine.worker_role.validate()?;

    let config = SupervisorConfig {
        pool_size: args.workers as usize + 1 + args.spare_machines,
        machine,
        ..Default::default()
    };

    let span = info_span!("roster-sim", run_id = %run_id);
    async move {
        info!(
            run_secs = args.run_secs,
            pool_size = config.pool_size,
            "starting simulation"
        );

        let store: Arc<dyn LeaseStore> = Arc::new(MemLeaseStore::new(MemStoreConfig {
            default_playtime: playtime,
            ..Default::default()
        }));
        let metrics = Arc::new(CoordinatorMetrics::default());

        if args.metrics_snapshot_interval_ms > 0 {
            let metrics = Arc::clone(&metrics);
            let interval_ms = args.metrics_snapshot_interval_ms;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    ticker.tick().await;
                    metrics.emit_snapshot();
                }
            });
        }

        let supervisor = Supervisor::new(
            run_id.clone(),
            Arc::clone(&store),
            Arc::new(UdpFactory),
            Arc::new(CountWorkload),
            config,
            Arc::clone(&metrics),
        );
        let deadline = Instant::now() + Duration::from_secs(args.run_secs);
        let report = supervisor.run(deadline).await;
        metrics.emit_snapshot();

        let paths = run_id.paths();
        let mut record = ProgressRecord::default();
        let loaded = ProgressStore::new(Arc::clone(&store), paths.progress.clone())
            .load(&mut record)
            .await;
        if loaded != ProgressLoad::Loaded {
            info!(?loaded, "no progress to report");
        }
        println!("run_id: {run_id}");
        println!("machines started: {}", report.machines_started);
        println!("finished: {}", record.finished);
        println!("pending: {}", record.pending.len());
        println!("next: {}", record.next);

        let listing = store
            .list_items(&paths.base)
            .await
            .context("listing run directory")?;
        println!(
            "{}: {} roles, {} data items",
            paths.base, listing.stats.role_count, listing.stats.data_item_count
        );
        for item in &listing.items {
            println!("  {item}");
        }
        Ok(())
    }
    .instrument(span)
    .await
}
