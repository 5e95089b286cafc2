//! Persisted form of the progress record.
//!
//! Stored as one JSON document (`application/json`). `pending` is a list so its order
//! survives the round trip through the store.

use std::collections::BTreeMap;

use roster_core::progress::{PendingEntry, ProgressRecord};
use serde::{Deserialize, Serialize};

use crate::{checked_range, non_empty, ConvertError, ToWire, TryToCore};

pub const PROGRESS_SCHEMA_VERSION: u32 = 1;
pub const PROGRESS_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRange {
    pub lower: u64,
    pub higher: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPending {
    pub lower: u64,
    pub higher: u64,
    pub sent_unix_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedProgress {
    pub schema_version: u32,
    pub next: u64,
    #[serde(default)]
    pub pending: Vec<PersistedPending>,
    #[serde(default)]
    pub busy_workers: BTreeMap<String, PersistedRange>,
    pub finished: u64,
}

impl ToWire<PersistedProgress> for ProgressRecord {
    fn to_wire(&self) -> PersistedProgress {
        PersistedProgress {
            schema_version: PROGRESS_SCHEMA_VERSION,
            next: self.next,
            pending: self
                .pending
                .iter()
                .map(|entry| PersistedPending {
                    lower: entry.assignment.lower,
                    higher: entry.assignment.higher,
                    sent_unix_time_ms: entry.sent_unix_time_ms,
                })
                .collect(),
            busy_workers: self
                .busy_workers
                .iter()
                .map(|(worker, a)| {
                    (
                        worker.clone(),
                        PersistedRange {
                            lower: a.lower,
                            higher: a.higher,
                        },
                    )
                })
                .collect(),
            finished: self.finished,
        }
    }
}

impl TryToCore<ProgressRecord> for PersistedProgress {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<ProgressRecord, Self::Error> {
        if self.schema_version != PROGRESS_SCHEMA_VERSION {
            return Err(ConvertError::UnsupportedSchema(self.schema_version));
        }

        let mut pending: Vec<PendingEntry> = Vec::with_capacity(self.pending.len());
        for p in &self.pending {
            let assignment = checked_range(p.lower, p.higher)?;
            if pending.iter().any(|e| e.assignment == assignment) {
                return Err(ConvertError::Malformed {
                    what: "progress",
                    reason: format!("range {assignment} is pending twice"),
                });
            }
            pending.push(PendingEntry {
                assignment,
                sent_unix_time_ms: p.sent_unix_time_ms,
            });
        }

        let mut busy_workers = BTreeMap::new();
        for (worker, r) in &self.busy_workers {
            non_empty("busy worker", worker)?;
            busy_workers.insert(worker.clone(), checked_range(r.lower, r.higher)?);
        }

        Ok(ProgressRecord {
            next: self.next,
            pending,
            busy_workers,
            finished: self.finished,
        })
    }
}

pub fn encode_progress(record: &ProgressRecord) -> Result<Vec<u8>, ConvertError> {
    serde_json::to_vec(&record.to_wire()).map_err(|err| ConvertError::Json(err.to_string()))
}

pub fn decode_progress(bytes: &[u8]) -> Result<ProgressRecord, ConvertError> {
    let persisted: PersistedProgress =
        serde_json::from_slice(bytes).map_err(|err| ConvertError::Json(err.to_string()))?;
    persisted.try_to_core()
}
