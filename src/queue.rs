use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::config::QueueConfig;
use crate::model::{
    sort_queue, ConflictId, ConflictResolution, ItemId, ItemMetadata, Priority, QueueItem,
    QueueStats, SyncConflict, UnixTimeMs,
};
use crate::offline_store::DurableQueueStore;

/// Resolved conflicts beyond this count are pruned oldest-first.
pub const MAX_CONFLICTS: usize = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),
}

#[derive(Debug, Default)]
struct QueueState {
    items: Vec<QueueItem>,
    conflicts: Vec<SyncConflict>,
    initialized: bool,
}

impl QueueState {
    fn unsynced(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter().filter(|i| !i.synced)
    }
}

/// Priority-ordered offline queue of step deltas plus sync conflict bookkeeping.
///
/// Memory is the source of truth while running; every mutation is mirrored to
/// the durable store on a best-effort basis. The state lock is held across the
/// persist so the store observes writes in mutation order.
pub struct StepQueue {
    store: DurableQueueStore,
    config: QueueConfig,
    state: Mutex<QueueState>,
    sync_in_progress: AtomicBool,
    storage_errors: AtomicU64,
}

impl std::fmt::Debug for StepQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepQueue")
            .field("config", &self.config)
            .field("sync_in_progress", &self.is_sync_in_progress())
            .finish_non_exhaustive()
    }
}

impl StepQueue {
    pub fn new(store: DurableQueueStore, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(QueueState::default()),
            sync_in_progress: AtomicBool::new(false),
            storage_errors: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Loads persisted state on the first call; later calls are no-ops.
    /// Corrupted or unreadable storage resets to an empty queue.
    pub async fn initialize(&self) {
        let _ = self.lock_loaded().await;
    }

    async fn lock_loaded(&self) -> MutexGuard<'_, QueueState> {
        let mut state = self.state.lock().await;
        if state.initialized {
            return state;
        }

        match self.store.load().await {
            Ok(persisted) => {
                state.items = persisted.items;
                state.conflicts = persisted.conflicts;
                sort_queue(&mut state.items);
                if state.items.len() > self.config.capacity {
                    warn!(
                        loaded = state.items.len(),
                        capacity = self.config.capacity,
                        "persisted queue exceeds capacity, truncating"
                    );
                    evict_overflow(&mut state.items, self.config.capacity);
                }
                info!(
                    items = state.items.len(),
                    conflicts = state.conflicts.len(),
                    "step queue initialized"
                );
            }
            Err(e) => {
                warn!(error = %e, "failed to load step queue, starting empty");
                state.items.clear();
                state.conflicts.clear();
            }
        }

        state.initialized = true;
        state
    }

    async fn persist_queue(&self, state: &QueueState) {
        if let Err(e) = self.store.save_queue(&state.items).await {
            self.storage_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "failed to persist step queue");
        }
    }

    async fn persist_conflicts(&self, state: &QueueState) {
        if let Err(e) = self.store.save_conflicts(&state.conflicts).await {
            self.storage_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "failed to persist sync conflicts");
        }
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Appends a delta and restores ordering. Beyond capacity, synced items
    /// awaiting cleanup go first (oldest first), then the tail of the order.
    ///
    /// Returns `None` when the new delta itself was the one evicted.
    /// Zero deltas are the producer's responsibility to filter.
    #[instrument(skip(self, metadata))]
    pub async fn queue_steps(
        &self,
        delta: i64,
        priority: Priority,
        metadata: Option<ItemMetadata>,
    ) -> Option<ItemId> {
        let mut state = self.lock_loaded().await;

        let item = QueueItem::new(
            delta,
            priority,
            metadata.unwrap_or_default(),
            UnixTimeMs::now(),
        );
        let id = item.id.clone();
        state.items.push(item);
        sort_queue(&mut state.items);

        for item in evict_overflow(&mut state.items, self.config.capacity) {
            if item.synced {
                debug!(item_id = %item.id, "queue full, dropping synced item early");
            } else {
                warn!(
                    item_id = %item.id,
                    delta = item.delta,
                    priority = ?item.priority,
                    "queue full, evicting lowest priority item"
                );
            }
        }

        self.persist_queue(&state).await;

        if state.items.iter().any(|i| i.id == id) {
            debug!(item_id = %id, queued = state.items.len(), "steps queued");
            Some(id)
        } else {
            None
        }
    }

    pub async fn unsynced_steps(&self) -> Vec<QueueItem> {
        let state = self.lock_loaded().await;
        state.unsynced().cloned().collect()
    }

    pub async fn unsynced_steps_by_priority(&self, min_priority: Priority) -> Vec<QueueItem> {
        let state = self.lock_loaded().await;
        state
            .unsynced()
            .filter(|i| i.priority >= min_priority)
            .cloned()
            .collect()
    }

    pub async fn total_unsynced_delta(&self) -> i64 {
        let state = self.lock_loaded().await;
        state.unsynced().map(|i| i.delta).sum()
    }

    /// Returns false when no item has this id.
    pub async fn increment_attempts(&self, id: &ItemId) -> bool {
        let mut state = self.lock_loaded().await;
        let now = UnixTimeMs::now();

        let found = match state.items.iter_mut().find(|i| &i.id == id) {
            Some(item) => {
                item.record_attempt(now);
                true
            }
            None => false,
        };

        if found {
            self.persist_queue(&state).await;
        } else {
            debug!(item_id = %id, "increment_attempts: item not found");
        }
        found
    }

    /// Records one attempt on every unsynced item with a single persist.
    pub async fn increment_unsynced_attempts(&self) -> usize {
        let mut state = self.lock_loaded().await;
        let now = UnixTimeMs::now();

        let mut count = 0;
        for item in state.items.iter_mut().filter(|i| !i.synced) {
            item.record_attempt(now);
            count += 1;
        }

        if count > 0 {
            self.persist_queue(&state).await;
        }
        count
    }

    /// Evicts poison items with `attempts >= max_attempts`.
    #[instrument(skip(self))]
    pub async fn remove_failed_items(&self, max_attempts: u32) -> usize {
        let mut state = self.lock_loaded().await;

        let before = state.items.len();
        state.items.retain(|i| !i.has_exhausted(max_attempts));
        let removed = before - state.items.len();

        if removed > 0 {
            warn!(removed, max_attempts, "removed items that exhausted their attempts");
            self.persist_queue(&state).await;
        }
        removed
    }

    pub async fn mark_all_synced(&self) {
        let mut state = self.lock_loaded().await;
        for item in state.items.iter_mut() {
            item.synced = true;
        }
        self.persist_queue(&state).await;
    }

    /// Marks only the given items; returns how many were found.
    pub async fn mark_synced(&self, ids: &[ItemId]) -> usize {
        let mut state = self.lock_loaded().await;
        let wanted: HashSet<&ItemId> = ids.iter().collect();

        let mut marked = 0;
        for item in state.items.iter_mut().filter(|i| wanted.contains(&i.id)) {
            item.synced = true;
            marked += 1;
        }

        self.persist_queue(&state).await;
        marked
    }

    pub async fn clear_synced(&self) -> usize {
        let mut state = self.lock_loaded().await;

        let before = state.items.len();
        state.items.retain(|i| !i.synced);
        let removed = before - state.items.len();

        if removed > 0 {
            debug!(removed, "cleared synced items");
            self.persist_queue(&state).await;
        }
        removed
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn record_conflict(
        &self,
        local_delta: i64,
        server_total: i64,
        expected_total: i64,
    ) -> SyncConflict {
        let mut state = self.lock_loaded().await;
        let now = UnixTimeMs::now();

        let base = ConflictId::at(now);
        let mut id = base.clone();
        let mut n = 1;
        while state.conflicts.iter().any(|c| c.id == id) {
            id = base.with_suffix(n);
            n += 1;
        }

        let conflict = SyncConflict::new(id, local_delta, server_total, expected_total, now);
        state.conflicts.push(conflict.clone());
        prune_resolved(&mut state.conflicts);

        warn!(
            conflict_id = %conflict.id,
            discrepancy = conflict.discrepancy(),
            "sync conflict recorded"
        );
        self.persist_conflicts(&state).await;
        conflict
    }

    pub async fn unresolved_conflicts(&self) -> Vec<SyncConflict> {
        let state = self.lock_loaded().await;
        state
            .conflicts
            .iter()
            .filter(|c| !c.resolved)
            .cloned()
            .collect()
    }

    pub async fn conflicts(&self) -> Vec<SyncConflict> {
        let state = self.lock_loaded().await;
        state.conflicts.clone()
    }

    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        resolution: ConflictResolution,
    ) -> Result<SyncConflict, QueueError> {
        let mut state = self.lock_loaded().await;

        let conflict = state
            .conflicts
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| QueueError::ConflictNotFound(id.to_string()))?;
        conflict.resolve(resolution);
        let resolved = conflict.clone();

        info!(conflict_id = %id, ?resolution, "conflict resolved");
        self.persist_conflicts(&state).await;
        Ok(resolved)
    }

    /// Resolves every pending conflict in favour of the server.
    pub async fn auto_resolve_conflicts(&self) -> usize {
        let mut state = self.lock_loaded().await;

        let mut resolved = 0;
        for conflict in state.conflicts.iter_mut().filter(|c| !c.resolved) {
            conflict.resolve(ConflictResolution::AcceptServer);
            resolved += 1;
        }

        if resolved > 0 {
            info!(resolved, "auto-resolved conflicts in favour of server");
            self.persist_conflicts(&state).await;
        }
        resolved
    }

    // ========================================================================
    // Sync claim
    // ========================================================================

    pub fn is_sync_in_progress(&self) -> bool {
        self.sync_in_progress.load(Ordering::Acquire)
    }

    pub fn set_sync_in_progress(&self, in_progress: bool) {
        self.sync_in_progress.store(in_progress, Ordering::Release);
    }

    /// Atomically claims the right to run a sync round. False if already claimed.
    pub fn try_begin_sync(&self) -> bool {
        self.sync_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub async fn stats(&self) -> QueueStats {
        let state = self.lock_loaded().await;
        let unsynced = state.unsynced().count();
        QueueStats {
            total: state.items.len(),
            synced: state.items.len() - unsynced,
            unsynced,
            total_delta: state.unsynced().map(|i| i.delta).sum(),
        }
    }

    pub fn storage_error_count(&self) -> u64 {
        self.storage_errors.load(Ordering::Relaxed)
    }
}

fn prune_resolved(conflicts: &mut Vec<SyncConflict>) {
    let mut excess = conflicts.len().saturating_sub(MAX_CONFLICTS);
    if excess == 0 {
        return;
    }
    // Oldest first; unresolved conflicts are never dropped.
    conflicts.retain(|c| {
        if excess > 0 && c.resolved {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

/// Trims a sorted item list to `capacity`, returning what was removed.
fn evict_overflow(items: &mut Vec<QueueItem>, capacity: usize) -> Vec<QueueItem> {
    let overflow = items.len().saturating_sub(capacity);
    if overflow == 0 {
        return Vec::new();
    }

    let mut synced: Vec<(UnixTimeMs, ItemId)> = items
        .iter()
        .filter(|i| i.synced)
        .map(|i| (i.timestamp, i.id.clone()))
        .collect();
    synced.sort_by_key(|(ts, _)| *ts);
    let doomed: HashSet<ItemId> = synced.into_iter().take(overflow).map(|(_, id)| id).collect();

    let (mut evicted, kept): (Vec<QueueItem>, Vec<QueueItem>) = std::mem::take(items)
        .into_iter()
        .partition(|i| doomed.contains(&i.id));
    *items = kept;

    if items.len() > capacity {
        evicted.extend(items.split_off(capacity));
    }
    evicted
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::capabilities::kv::MemoryKv;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High),
            Just(Priority::Critical),
        ]
    }

    fn run<F: std::future::Future<Output = ()>>(fut: F) {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn ordering_capacity_and_conservation(
            ops in prop::collection::vec((-500i64..500, priority()), 1..130),
            synced_prefix in 0usize..20,
        ) {
            run(async move {
                let queue = StepQueue::new(
                    DurableQueueStore::new(Arc::new(MemoryKv::new())),
                    QueueConfig::default(),
                );
                for (delta, p) in &ops {
                    queue.queue_steps(*delta, *p, None).await;
                }

                let ids: Vec<ItemId> = queue
                    .unsynced_steps()
                    .await
                    .into_iter()
                    .take(synced_prefix)
                    .map(|i| i.id)
                    .collect();
                queue.mark_synced(&ids).await;

                let items = queue.unsynced_steps().await;
                assert!(items.len() <= 100);
                for pair in items.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    assert!(
                        a.priority > b.priority
                            || (a.priority == b.priority && a.timestamp <= b.timestamp)
                    );
                }

                let expected: i64 = items.iter().map(|i| i.delta).sum();
                assert_eq!(queue.total_unsynced_delta().await, expected);
                assert_eq!(queue.stats().await.total_delta, expected);

                let total = ops.len().min(100);
                assert_eq!(queue.stats().await.total, total);
            });
        }
    }
}
