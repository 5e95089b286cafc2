use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies one run of the manager/worker protocol. All role and data paths of a run
/// live under `/manager_workers/<run_id>/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunIdParseError {
    #[error("empty run id")]
    Empty,
    #[error("run id must not contain '/', '\\' or '..'")]
    InvalidCharacters,
}

impl RunId {
    pub fn parse(input: &str) -> Result<Self, RunIdParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RunIdParseError::Empty);
        }
        if input.contains('/') || input.contains('\\') || input.contains("..") {
            return Err(RunIdParseError::InvalidCharacters);
        }
        Ok(Self(input.to_string()))
    }

    pub fn paths(&self) -> RunPaths {
        let base = format!("/manager_workers/{}", self.0);
        RunPaths {
            manager_role: format!("{base}/manager"),
            worker_role: format!("{base}/workers"),
            progress: format!("{base}/problem"),
            base,
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store paths used by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub base: String,
    pub manager_role: String,
    pub worker_role: String,
    pub progress: String,
}

/// A contiguous unit of work handed from the manager to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub lower: u64,
    pub higher: u64, // half-open [lower, higher)
}

impl Assignment {
    pub fn new(lower: u64, higher: u64) -> Self {
        Self { lower, higher }
    }

    pub fn len(&self) -> u64 {
        self.higher.saturating_sub(self.lower)
    }

    pub fn is_empty(&self) -> bool {
        self.lower >= self.higher
    }

    pub fn contains(&self, n: u64) -> bool {
        self.lower <= n && n < self.higher
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.lower, self.higher)
    }
}

/// What a machine is currently doing.
///
/// `Started` is only ever the initial state; every pass of the machine loop ends in one of
/// the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MachineStatus {
    #[default]
    Started,
    Idle,
    Manager,
    Worker,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Started => "STARTED",
            MachineStatus::Idle => "IDLE",
            MachineStatus::Manager => "MANAGER",
            MachineStatus::Worker => "WORKER",
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local wall clock in Unix milliseconds. Lease expirations are expressed on this clock.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u64::MAX as u128) as u64
}
