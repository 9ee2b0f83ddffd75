//! Offline-first step synchronisation.
//!
//! Step deltas recorded on the device land in a durable priority queue, are
//! batched to the steps REST endpoint by the sync engine, and the running
//! total comes back over a realtime WebSocket channel, with polling as the
//! fallback for views that cannot use the socket.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod event;
pub mod model;
pub mod offline_store;
pub mod polling;
pub mod queue;
pub mod realtime;
pub mod sync;
pub mod telemetry;

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use capabilities::{
    ApiEndpoint, CredentialProvider, Credentials, KeyValueStore, KvError, LifecycleHub,
    LifecycleSource, MemoryKv, ReqwestStepsApi, StaticCredentials, StepsApi, TransportError,
};
pub use config::{ConfigError, StepSyncConfig};
pub use event::TotalUpdate;
pub use model::{ItemId, ItemMetadata, Priority, QueueItem, QueueStats, SyncConflict};
pub use offline_store::{DurableQueueStore, StoreError};
pub use polling::{PollState, PollingEngine, PollingOptions, PushSource};
pub use queue::{QueueError, StepQueue};
pub use realtime::{ChannelDeps, ChannelError, ConnectionState, RealtimeChannel, StepsDelivery};
pub use sync::{SyncEngine, SyncOutcome};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Validation,
    NotFound,
    Storage,
    Deserialization,
    InvalidState,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Storage => "STORAGE_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Storage)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kv(KvError::InvalidKey { .. } | KvError::ValueTooLarge { .. }) => {
                ErrorKind::Validation
            }
            Error::Kv(KvError::Serialization { .. }) => ErrorKind::Deserialization,
            Error::Kv(KvError::Storage { .. }) | Error::Store(StoreError::Kv(_)) => {
                ErrorKind::Storage
            }
            Error::Store(StoreError::Corrupted { .. }) => ErrorKind::Deserialization,
            Error::Queue(QueueError::ConflictNotFound(_)) => ErrorKind::NotFound,
            Error::Transport(e) | Error::Channel(ChannelError::Transport(e)) => transport_kind(e),
            Error::Channel(ChannelError::Stopped) => ErrorKind::InvalidState,
            Error::Config(_) => ErrorKind::Validation,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(e) | Error::Channel(ChannelError::Transport(e)) => e.is_retryable(),
            other => other.kind().is_retryable(),
        }
    }
}

fn transport_kind(e: &TransportError) -> ErrorKind {
    match e {
        TransportError::Timeout { .. } => ErrorKind::Timeout,
        TransportError::Connection { .. } | TransportError::HttpStatus { .. } => ErrorKind::Network,
        TransportError::MissingCredentials | TransportError::Unauthorized { .. } => {
            ErrorKind::Authentication
        }
        TransportError::InvalidUrl { .. } => ErrorKind::Validation,
        TransportError::InvalidResponse { .. } => ErrorKind::Deserialization,
    }
}

// ============================================================================
// Composition root
// ============================================================================

/// Owns the queue, the sync engine and the realtime channel for one signed-in
/// device. Build it once in the host shell and hand out clones of the `Arc`s.
pub struct StepSync {
    config: StepSyncConfig,
    queue: Arc<StepQueue>,
    sync: Arc<SyncEngine>,
    realtime: Arc<RealtimeChannel>,
    api: Arc<dyn StepsApi>,
    credentials: Arc<dyn CredentialProvider>,
    lifecycle: Arc<dyn LifecycleSource>,
}

impl std::fmt::Debug for StepSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepSync")
            .field("api_base_url", &self.config.api_base_url)
            .field("realtime", &self.realtime)
            .finish_non_exhaustive()
    }
}

impl StepSync {
    /// Starts against the configured REST endpoint.
    pub async fn start(
        config: StepSyncConfig,
        kv: Arc<dyn KeyValueStore>,
        credentials: Arc<dyn CredentialProvider>,
        lifecycle: Arc<dyn LifecycleSource>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let endpoint = ApiEndpoint::new(&config.api_base_url)?;
        let api = ReqwestStepsApi::new(
            endpoint,
            Arc::clone(&credentials),
            config.sync.request_timeout(),
        )?;
        Self::with_api(config, kv, credentials, lifecycle, Arc::new(api)).await
    }

    /// Loads the persisted queue, spawns the realtime driver and connects it
    /// when the app is foregrounded and online.
    #[instrument(skip_all, fields(api_base_url = %config.api_base_url))]
    pub async fn with_api(
        config: StepSyncConfig,
        kv: Arc<dyn KeyValueStore>,
        credentials: Arc<dyn CredentialProvider>,
        lifecycle: Arc<dyn LifecycleSource>,
        api: Arc<dyn StepsApi>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let endpoint = ApiEndpoint::new(&config.api_base_url)?;

        let queue = Arc::new(StepQueue::new(
            DurableQueueStore::new(kv),
            config.queue.clone(),
        ));
        queue.initialize().await;

        let sync = Arc::new(SyncEngine::new(Arc::clone(&queue), config.sync.clone()));

        let realtime = Arc::new(RealtimeChannel::spawn(
            config.realtime.clone(),
            ChannelDeps {
                endpoint,
                credentials: Arc::clone(&credentials),
                api: Arc::clone(&api),
                sync: Arc::clone(&sync),
                lifecycle: Arc::clone(&lifecycle),
                sync_max_retries: config.sync.max_retries,
            },
        ));

        let snapshot = lifecycle.snapshot();
        if snapshot.is_foreground() && snapshot.online {
            realtime.connect()?;
        } else {
            debug!(?snapshot, "starting with realtime channel idle");
        }

        info!(
            unsynced = queue.stats().await.unsynced,
            "step sync started"
        );

        Ok(Self {
            config,
            queue,
            sync,
            realtime,
            api,
            credentials,
            lifecycle,
        })
    }

    pub fn config(&self) -> &StepSyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<StepQueue> {
        &self.queue
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn realtime(&self) -> &Arc<RealtimeChannel> {
        &self.realtime
    }

    /// Hands a freshly counted delta to the realtime channel, which posts it
    /// or queues it. Zero deltas are dropped here and return `None`.
    #[instrument(skip(self))]
    pub async fn record_steps(
        &self,
        delta: i64,
        source: &str,
    ) -> Result<Option<StepsDelivery>, Error> {
        if delta == 0 {
            debug!("ignoring zero step delta");
            return Ok(None);
        }

        let mut metadata = ItemMetadata::from_source(source);
        if let Some(credentials) = self.credentials.credentials().await {
            metadata.user_id = Some(credentials.user_id.clone());
            metadata.participant_id = credentials.participant_id.clone();
        }

        let delivery = self
            .realtime
            .sync_steps_with(delta, Some(metadata))
            .await?;
        Ok(Some(delivery))
    }

    /// Runs one sync round now, regardless of the channel state.
    pub async fn sync_now(&self) -> SyncOutcome {
        self.run_sync(None).await
    }

    /// Like [`StepSync::sync_now`], but checks the server's answer against
    /// `prior_total` plus the queued delta and records a conflict on mismatch.
    pub async fn sync_now_against(&self, prior_total: i64) -> SyncOutcome {
        self.run_sync(Some(prior_total)).await
    }

    async fn run_sync(&self, prior_total: Option<i64>) -> SyncOutcome {
        let api = Arc::clone(&self.api);
        self.sync
            .sync_with_retry_against(
                prior_total,
                move |request| {
                    let api = Arc::clone(&api);
                    async move {
                        api.post_steps(request.delta, &request.idempotency_key)
                            .await
                    }
                },
                self.config.sync.max_retries,
            )
            .await
    }

    /// Polls `fetch` with the app lifecycle wired in.
    pub fn poll<T, F, Fut>(
        &self,
        fetch: F,
        config: config::PollingConfig,
    ) -> Result<PollingEngine<T>, ConfigError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let options = PollingOptions::new(config).with_lifecycle(Arc::clone(&self.lifecycle));
        PollingEngine::spawn(fetch, options)
    }

    /// Polls the running total, preferring whatever the realtime channel has
    /// pushed while it is connected.
    pub fn poll_totals<F, Fut>(&self, fetch: F) -> Result<PollingEngine<TotalUpdate>, ConfigError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TotalUpdate, TransportError>> + Send + 'static,
    {
        let push: Arc<dyn PushSource<TotalUpdate>> = self.realtime.clone();
        let options = PollingOptions::new(self.config.polling.clone())
            .with_lifecycle(Arc::clone(&self.lifecycle))
            .with_push(push);
        PollingEngine::spawn(fetch, options)
    }

    /// Stops the realtime driver and cancels the delayed queue cleanup.
    pub async fn shutdown(&self) {
        self.realtime.shutdown().await;
        self.sync.cancel_pending_cleanup();
        info!("step sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        let e = Error::from(TransportError::Timeout { timeout_ms: 5 });
        assert_eq!(e.kind(), ErrorKind::Timeout);
        assert!(e.is_retryable());

        let e = Error::from(TransportError::from_status(401, "nope"));
        assert_eq!(e.kind(), ErrorKind::Authentication);
        assert!(!e.is_retryable());

        let e = Error::from(TransportError::from_status(404, "missing"));
        assert_eq!(e.kind(), ErrorKind::Network);
        assert!(!e.is_retryable());

        let e = Error::from(QueueError::ConflictNotFound("c1".into()));
        assert_eq!(e.kind().code(), "NOT_FOUND");

        let e = Error::from(ChannelError::Stopped);
        assert_eq!(e.kind(), ErrorKind::InvalidState);

        let e = Error::from(KvError::storage("disk full"));
        assert_eq!(e.kind(), ErrorKind::Storage);
        assert!(e.is_retryable());
    }
}
