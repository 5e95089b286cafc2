use std::sync::Arc;

use roster_core::progress::ProgressRecord;
use roster_store::{ErrorCode, LeaseStore};
use roster_wire::progress::{decode_progress, encode_progress, PROGRESS_CONTENT_TYPE};
use tracing::{debug, warn};

/// Outcome of [`ProgressStore::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressLoad {
    /// The stored snapshot replaced the in-memory record.
    Loaded,
    /// Nothing has been saved yet; the in-memory record is the starting point.
    Absent,
    /// The store could not be read or held an unreadable snapshot. The in-memory record
    /// says nothing about the durable state and must not be saved over it.
    Failed,
}

impl ProgressLoad {
    /// Whether the in-memory record now reflects the durable state.
    pub fn is_synced(self) -> bool {
        !matches!(self, ProgressLoad::Failed)
    }
}

/// Whole-record persistence of the [`ProgressRecord`] at one blob path.
///
/// There is no fencing: only the manager role holder writes, and the role is exclusive.
#[derive(Clone)]
pub struct ProgressStore {
    store: Arc<dyn LeaseStore>,
    path: String,
}

impl ProgressStore {
    pub fn new(store: Arc<dyn LeaseStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    /// Replaces `record` with the stored snapshot. Leaves it untouched unless the result is
    /// [`ProgressLoad::Loaded`].
    pub async fn load(&self, record: &mut ProgressRecord) -> ProgressLoad {
        let read = match self.store.read_data(&self.path).await {
            Ok(read) => read,
            Err(err) if err.code == ErrorCode::NotFound => {
                debug!(path = %self.path, "no saved progress yet");
                return ProgressLoad::Absent;
            }
            Err(err) => {
                warn!(path = %self.path, error = %err, "progress load failed");
                return ProgressLoad::Failed;
            }
        };

        match decode_progress(&read.content) {
            Ok(loaded) => {
                *record = loaded;
                ProgressLoad::Loaded
            }
            Err(err) => {
                warn!(path = %self.path, error = %err, "stored progress is unreadable");
                ProgressLoad::Failed
            }
        }
    }

    pub async fn save(&self, record: &ProgressRecord) -> bool {
        let bytes = match encode_progress(record) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %self.path, error = %err, "progress encode failed");
                return false;
            }
        };
        match self
            .store
            .write_data(&self.path, &bytes, PROGRESS_CONTENT_TYPE, None)
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(path = %self.path, error = %err, "progress save failed");
                false
            }
        }
    }
}
