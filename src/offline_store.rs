use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::capabilities::kv::{self, KeyValueStore, KvError};
use crate::model::{QueueItem, SyncConflict};

pub const STEP_QUEUE_KEY: &str = "step_queue";
pub const STEP_CONFLICTS_KEY: &str = "step_conflicts";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Kv(KvError),

    #[error("corrupted store under '{key}': {reason}")]
    Corrupted { key: String, reason: String },
}

impl From<KvError> for StoreError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Serialization { key, message } => StoreError::Corrupted {
                key,
                reason: message,
            },
            other => StoreError::Kv(other),
        }
    }
}

/// Everything the queue needs to resume after a restart.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PersistedQueue {
    pub items: Vec<QueueItem>,
    pub conflicts: Vec<SyncConflict>,
}

/// Passive persisted mirror of the step queue. Only the queue manager writes it.
#[derive(Clone)]
pub struct DurableQueueStore {
    kv: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for DurableQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueueStore").finish_non_exhaustive()
    }
}

impl DurableQueueStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Loads both collections. Missing keys are empty collections; malformed
    /// JSON is `StoreError::Corrupted`.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<PersistedQueue, StoreError> {
        let items: Vec<QueueItem> = kv::get_json(self.kv.as_ref(), STEP_QUEUE_KEY)
            .await?
            .unwrap_or_default();
        let conflicts: Vec<SyncConflict> = kv::get_json(self.kv.as_ref(), STEP_CONFLICTS_KEY)
            .await?
            .unwrap_or_default();

        debug!(
            items = items.len(),
            conflicts = conflicts.len(),
            "loaded persisted step queue"
        );

        Ok(PersistedQueue { items, conflicts })
    }

    pub async fn save_queue(&self, items: &[QueueItem]) -> Result<(), StoreError> {
        kv::set_json(self.kv.as_ref(), STEP_QUEUE_KEY, items).await?;
        Ok(())
    }

    pub async fn save_conflicts(&self, conflicts: &[SyncConflict]) -> Result<(), StoreError> {
        kv::set_json(self.kv.as_ref(), STEP_CONFLICTS_KEY, conflicts).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.kv.remove(STEP_QUEUE_KEY).await?;
        self.kv.remove(STEP_CONFLICTS_KEY).await?;
        Ok(())
    }
}
