use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::http::{IdempotencyKey, TransportError};
use crate::config::SyncConfig;
use crate::model::ItemId;
use crate::queue::StepQueue;

/// Result of claiming a sync round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPreparation {
    pub total_delta: i64,
    pub item_count: usize,
    /// `current_server_total + total_delta`, when a server total was supplied.
    pub expected_total: Option<i64>,
    /// Unresolved conflicts were already pending when the round was claimed.
    pub has_conflict: bool,
}

impl SyncPreparation {
    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }
}

/// Argument handed to the caller's network call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncRequest {
    pub delta: i64,
    /// Stable across the retries of one round.
    pub idempotency_key: IdempotencyKey,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Queue empty or another round already claimed.
    NothingToSync,
    Synced { server_total: i64, attempts: u32 },
    Failed { error: TransportError, attempts: u32 },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, SyncOutcome::Failed { .. })
    }

    pub fn server_total(&self) -> Option<i64> {
        match self {
            SyncOutcome::Synced { server_total, .. } => Some(*server_total),
            _ => None,
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub rounds_started: AtomicU64,
    pub rounds_succeeded: AtomicU64,
    pub rounds_failed: AtomicU64,
    pub network_attempts: AtomicU64,
    pub conflicts_recorded: AtomicU64,
    pub items_evicted: AtomicU64,
}

impl SyncMetrics {
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            rounds_succeeded: self.rounds_succeeded.load(Ordering::Relaxed),
            rounds_failed: self.rounds_failed.load(Ordering::Relaxed),
            network_attempts: self.network_attempts.load(Ordering::Relaxed),
            conflicts_recorded: self.conflicts_recorded.load(Ordering::Relaxed),
            items_evicted: self.items_evicted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    pub rounds_started: u64,
    pub rounds_succeeded: u64,
    pub rounds_failed: u64,
    pub network_attempts: u64,
    pub conflicts_recorded: u64,
    pub items_evicted: u64,
}

// ============================================================================
// Engine
// ============================================================================

/// Turns the unsynced queue into one aggregated network call per round,
/// with bounded retry and conflict detection.
pub struct SyncEngine {
    queue: Arc<StepQueue>,
    config: SyncConfig,
    max_attempts: u32,
    round: Mutex<Option<Vec<ItemId>>>,
    cleanup: Mutex<Vec<JoinHandle<()>>>,
    metrics: SyncMetrics,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(queue: Arc<StepQueue>, config: SyncConfig) -> Self {
        let max_attempts = queue.config().max_attempts;
        Self {
            queue,
            config,
            max_attempts,
            round: Mutex::new(None),
            cleanup: Mutex::new(Vec::new()),
            metrics: SyncMetrics::default(),
        }
    }

    pub fn queue(&self) -> &Arc<StepQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        Duration::from_millis(self.config.base_backoff_ms.saturating_mul(1u64 << exponent))
    }

    fn take_round(&self) -> Option<Vec<ItemId>> {
        self.round
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Claims the round. Returns an empty preparation, holding no claim, when a
    /// round is already in progress or nothing is queued.
    #[instrument(skip(self))]
    pub async fn prepare_sync(&self, current_server_total: Option<i64>) -> SyncPreparation {
        if !self.queue.try_begin_sync() {
            debug!("sync already in progress");
            return SyncPreparation::default();
        }

        let items = self.queue.unsynced_steps().await;
        if items.is_empty() {
            self.queue.set_sync_in_progress(false);
            return SyncPreparation::default();
        }

        let total_delta: i64 = items.iter().map(|i| i.delta).sum();
        let expected_total = current_server_total.map(|t| t.saturating_add(total_delta));
        let has_conflict = current_server_total.is_some()
            && !self.queue.unresolved_conflicts().await.is_empty();

        *self.round.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(items.iter().map(|i| i.id.clone()).collect());

        debug!(total_delta, item_count = items.len(), "sync round claimed");
        SyncPreparation {
            total_delta,
            item_count: items.len(),
            expected_total,
            has_conflict,
        }
    }

    /// Reconciles the claimed round with the server's answer and releases the claim.
    ///
    /// Without a prepared round every item is marked synced.
    #[instrument(skip(self))]
    pub async fn complete_sync(&self, actual_server_total: Option<i64>, expected_total: Option<i64>) {
        let round = self.take_round();

        if let (Some(actual), Some(expected)) = (actual_server_total, expected_total) {
            if actual != expected {
                let local_delta = match &round {
                    Some(ids) => {
                        let ids: HashSet<&ItemId> = ids.iter().collect();
                        self.queue
                            .unsynced_steps()
                            .await
                            .iter()
                            .filter(|i| ids.contains(&i.id))
                            .map(|i| i.delta)
                            .sum()
                    }
                    None => self.queue.total_unsynced_delta().await,
                };
                self.queue.record_conflict(local_delta, actual, expected).await;
                self.metrics.conflicts_recorded.fetch_add(1, Ordering::Relaxed);
                self.queue.auto_resolve_conflicts().await;
            }
        }

        match &round {
            Some(ids) => {
                self.queue.mark_synced(ids).await;
            }
            None => self.queue.mark_all_synced().await,
        }

        let evicted = self.queue.remove_failed_items(self.max_attempts).await;
        if evicted > 0 {
            self.metrics
                .items_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }

        self.schedule_cleanup();
        self.queue.set_sync_in_progress(false);
    }

    /// Each round keeps its own timer so earlier rounds are still cleared.
    fn schedule_cleanup(&self) {
        let queue = Arc::clone(&self.queue);
        let delay = self.config.cleanup_delay();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.clear_synced().await;
        });

        let mut handles = self.cleanup.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn cancel_pending_cleanup(&self) {
        let handles =
            std::mem::take(&mut *self.cleanup.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            handle.abort();
        }
    }

    fn abandon_round(&self) {
        self.take_round();
        self.queue.set_sync_in_progress(false);
    }

    pub async fn sync_with_retry<F, Fut>(&self, sync_fn: F, max_retries: u32) -> SyncOutcome
    where
        F: FnMut(SyncRequest) -> Fut,
        Fut: Future<Output = Result<i64, TransportError>>,
    {
        self.sync_with_retry_against(None, sync_fn, max_retries)
            .await
    }

    /// Runs one full round. `prior_total` is the last known server total; when
    /// given, a server answer other than `prior_total + delta` records a conflict.
    #[instrument(skip(self, sync_fn))]
    pub async fn sync_with_retry_against<F, Fut>(
        &self,
        prior_total: Option<i64>,
        mut sync_fn: F,
        max_retries: u32,
    ) -> SyncOutcome
    where
        F: FnMut(SyncRequest) -> Fut,
        Fut: Future<Output = Result<i64, TransportError>>,
    {
        let prep = self.prepare_sync(prior_total).await;
        if prep.is_empty() {
            return SyncOutcome::NothingToSync;
        }

        self.metrics.rounds_started.fetch_add(1, Ordering::Relaxed);
        let key = IdempotencyKey::generate();
        let max_retries = max_retries.max(1);

        info!(
            total_delta = prep.total_delta,
            item_count = prep.item_count,
            idempotency_key = %key,
            "starting sync round"
        );

        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_retries {
            self.queue.increment_unsynced_attempts().await;
            self.metrics.network_attempts.fetch_add(1, Ordering::Relaxed);

            let request = SyncRequest {
                delta: prep.total_delta,
                idempotency_key: key.clone(),
            };
            let result = sync_fn(request).await;
            attempts += 1;

            match result {
                Ok(server_total) => {
                    self.complete_sync(Some(server_total), prep.expected_total)
                        .await;
                    self.metrics.rounds_succeeded.fetch_add(1, Ordering::Relaxed);
                    info!(server_total, attempts, "sync round succeeded");
                    return SyncOutcome::Synced {
                        server_total,
                        attempts,
                    };
                }
                Err(e) if !e.is_retryable() => {
                    error!(error = %e, attempts, "sync round hit a fatal error");
                    last_error = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, attempt = attempts, max_retries, "sync attempt failed");
                    last_error = Some(e);
                    if attempts < max_retries {
                        tokio::time::sleep(self.backoff(attempts - 1)).await;
                    }
                }
            }
        }

        self.abandon_round();
        self.metrics.rounds_failed.fetch_add(1, Ordering::Relaxed);

        let error = last_error.unwrap_or(TransportError::Connection {
            message: "sync round made no attempts".to_string(),
        });
        warn!(error = %error, attempts, "sync round failed, items stay queued");
        SyncOutcome::Failed { error, attempts }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.cancel_pending_cleanup();
    }
}
