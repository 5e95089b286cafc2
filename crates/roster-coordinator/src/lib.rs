#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Fault-tolerant manager/worker task distribution built on role leases.
//!
//! Machines compete for one exclusive manager role and a capped worker role. The manager
//! hands out ranges over a lossy datagram channel and persists its bookkeeping to the lease
//! store after every iteration, so a successor resumes where a crashed manager stopped.

pub mod channel;
pub mod machine;
pub mod manager;
pub mod metrics;
pub mod progress_store;
pub mod supervisor;
pub mod worker;

pub use channel::{ChannelFactory, Datagram, MemNetwork, UdpFactory};
pub use machine::{Machine, MachineConfig};
pub use manager::{Manager, ManagerConfig, ManagerReport};
pub use metrics::CoordinatorMetrics;
pub use progress_store::{ProgressLoad, ProgressStore};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorReport};
pub use worker::{CountWorkload, Worker, WorkerConfig, WorkerReport, Workload};
