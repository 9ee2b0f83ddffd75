//! Realtime push channel: a WebSocket client with reconnect/backoff and
//! lifecycle-aware suspension.
//!
//! One driver task owns the [`ChannelCore`] and the socket. Public calls,
//! lifecycle events, socket frames and timers all arrive on the driver's event
//! channel; the core decides and the driver executes the resulting commands.

pub mod state;

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::credentials::CredentialProvider;
use crate::capabilities::http::{ApiEndpoint, IdempotencyKey, StepsApi, TransportError};
use crate::capabilities::lifecycle::{self, LifecycleEvent, LifecycleSource};
use crate::config::RealtimeConfig;
use crate::event::{parse_server_message, ClientMessage, TotalUpdate, WireError};
use crate::model::{ItemId, ItemMetadata, Priority, UnixTimeMs};
use crate::polling::PushSource;
use crate::sync::{SyncEngine, SyncOutcome};

pub use self::state::{
    ChannelCommand, ChannelCore, ChannelData, ChannelSnapshot, ConnectFailure, ConnectionState,
    ReconnectPolicy, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION, CLOSE_SERVER_ERROR,
};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("steps sync failed: {0}")]
    Transport(#[from] TransportError),

    #[error("realtime channel has been shut down")]
    Stopped,
}

/// What happened to a delta handed to [`RealtimeChannel::sync_steps`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepsDelivery {
    Sent { total_steps: i64 },
    Queued { id: ItemId },
    /// The queue was full of higher priority work and dropped the delta.
    Discarded,
}

/// Collaborators the driver needs besides configuration.
#[derive(Clone)]
pub struct ChannelDeps {
    pub endpoint: ApiEndpoint,
    pub credentials: Arc<dyn CredentialProvider>,
    pub api: Arc<dyn StepsApi>,
    pub sync: Arc<SyncEngine>,
    pub lifecycle: Arc<dyn LifecycleSource>,
    pub sync_max_retries: u32,
}

enum DriverEvent {
    Connect,
    Disconnect,
    Reconnect,
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Opened {
        generation: u64,
        outgoing: mpsc::UnboundedSender<Message>,
    },
    ConnectFailed {
        generation: u64,
        failure: ConnectFailure,
    },
    Frame {
        generation: u64,
        text: String,
    },
    SocketError {
        generation: u64,
        message: String,
    },
    Closed {
        generation: u64,
        code: u16,
        reason: String,
    },
    ReconnectTimer,
    KeepAliveTick,
    Shutdown,
}

pub struct RealtimeChannel {
    events: mpsc::UnboundedSender<DriverEvent>,
    snapshot: watch::Receiver<ChannelSnapshot>,
    driver: Mutex<Option<JoinHandle<()>>>,
    api: Arc<dyn StepsApi>,
    sync: Arc<SyncEngine>,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RealtimeChannel {
    /// Spawns the driver. The channel starts disconnected; call
    /// [`RealtimeChannel::connect`] to open it.
    pub fn spawn(config: RealtimeConfig, deps: ChannelDeps) -> Self {
        let lifecycle = deps.lifecycle.snapshot();
        let core = ChannelCore::new(&config, lifecycle.is_foreground(), lifecycle.online);
        let (snapshot_tx, snapshot) = watch::channel(core.snapshot());
        let (events, events_rx) = mpsc::unbounded_channel();

        let api = Arc::clone(&deps.api);
        let sync = Arc::clone(&deps.sync);

        let driver = Driver {
            core,
            config,
            lifecycle_rx: Some(deps.lifecycle.subscribe()),
            deps,
            events: events.clone(),
            snapshot_tx,
            socket: None,
            reconnect_timer: None,
            keep_alive: None,
            sync_task: None,
        };
        let handle = tokio::spawn(driver.run(events_rx));

        Self {
            events,
            snapshot,
            driver: Mutex::new(Some(handle)),
            api,
            sync,
        }
    }

    fn send(&self, event: DriverEvent) -> Result<(), ChannelError> {
        self.events.send(event).map_err(|_| ChannelError::Stopped)
    }

    pub fn connect(&self) -> Result<(), ChannelError> {
        self.send(DriverEvent::Connect)
    }

    /// Sticky until [`RealtimeChannel::reconnect`] or [`RealtimeChannel::connect`].
    pub fn disconnect(&self) -> Result<(), ChannelError> {
        self.send(DriverEvent::Disconnect)
    }

    pub fn reconnect(&self) -> Result<(), ChannelError> {
        self.send(DriverEvent::Reconnect)
    }

    pub fn subscribe(&self, channels: &[&str]) -> Result<(), ChannelError> {
        self.send(DriverEvent::Subscribe(
            channels.iter().map(|c| c.to_string()).collect(),
        ))
    }

    pub fn unsubscribe(&self, channels: &[&str]) -> Result<(), ChannelError> {
        self.send(DriverEvent::Unsubscribe(
            channels.iter().map(|c| c.to_string()).collect(),
        ))
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshot.clone()
    }

    pub async fn sync_steps(&self, delta: i64) -> Result<StepsDelivery, ChannelError> {
        self.sync_steps_with(delta, None).await
    }

    /// Posts immediately while connected, otherwise queues for the next sync
    /// round. A failed post is queued before the error is returned.
    #[instrument(skip(self, metadata))]
    pub async fn sync_steps_with(
        &self,
        delta: i64,
        metadata: Option<ItemMetadata>,
    ) -> Result<StepsDelivery, ChannelError> {
        let queue = self.sync.queue();

        if self.state() != ConnectionState::Connected {
            return Ok(match queue.queue_steps(delta, Priority::Normal, metadata).await {
                Some(id) => {
                    debug!(item_id = %id, "realtime channel offline, steps queued");
                    StepsDelivery::Queued { id }
                }
                None => {
                    warn!(delta, "realtime channel offline and queue full, steps discarded");
                    StepsDelivery::Discarded
                }
            });
        }

        match self.api.post_steps(delta, &IdempotencyKey::generate()).await {
            Ok(total_steps) => Ok(StepsDelivery::Sent { total_steps }),
            Err(e) => {
                let id = queue.queue_steps(delta, Priority::Normal, metadata).await;
                warn!(error = %e, item_id = ?id, "direct steps post failed, queued instead");
                Err(ChannelError::Transport(e))
            }
        }
    }

    /// Stops the driver, closing the socket and cancelling its timers.
    pub async fn shutdown(&self) {
        let _ = self.events.send(DriverEvent::Shutdown);
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "realtime driver task failed");
                }
            }
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        let _ = self.events.send(DriverEvent::Shutdown);
    }
}

impl PushSource<TotalUpdate> for RealtimeChannel {
    fn connect(&self) {
        if let Err(e) = RealtimeChannel::connect(self) {
            debug!(error = %e, "push source connect ignored");
        }
    }

    fn disconnect(&self) {
        if let Err(e) = RealtimeChannel::disconnect(self) {
            debug!(error = %e, "push source disconnect ignored");
        }
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn latest(&self) -> Option<TotalUpdate> {
        self.snapshot.borrow().data.total.clone()
    }
}

// ============================================================================
// Driver
// ============================================================================

struct ActiveSocket {
    generation: u64,
    /// Handshake, then the read loop.
    task: JoinHandle<()>,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
}

struct Driver {
    core: ChannelCore,
    config: RealtimeConfig,
    deps: ChannelDeps,
    lifecycle_rx: Option<broadcast::Receiver<LifecycleEvent>>,
    events: mpsc::UnboundedSender<DriverEvent>,
    snapshot_tx: watch::Sender<ChannelSnapshot>,
    socket: Option<ActiveSocket>,
    reconnect_timer: Option<JoinHandle<()>>,
    keep_alive: Option<JoinHandle<()>>,
    sync_task: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<DriverEvent>) {
        debug!("realtime driver started");
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => DriverEvent::Shutdown,
                },
                lifecycle = lifecycle::next_event(&mut self.lifecycle_rx) => {
                    match lifecycle {
                        Ok(event) => self.apply_lifecycle(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "lifecycle events lagged, resyncing from snapshot");
                            self.resync_lifecycle();
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.lifecycle_rx = None;
                        }
                    }
                    continue;
                }
            };

            if matches!(event, DriverEvent::Shutdown) {
                break;
            }
            self.handle(event);
        }

        self.teardown();
        debug!("realtime driver stopped");
    }

    fn apply_lifecycle(&mut self, event: LifecycleEvent) {
        let cmds = match event {
            LifecycleEvent::Foreground => self.core.foreground(),
            LifecycleEvent::Background => self.core.background(),
            LifecycleEvent::NetworkChanged { online } => self.core.network_changed(online),
        };
        self.execute(cmds);
    }

    fn resync_lifecycle(&mut self) {
        let snapshot = self.deps.lifecycle.snapshot();
        let mut cmds = self.core.network_changed(snapshot.online);
        cmds.extend(if snapshot.is_foreground() {
            self.core.foreground()
        } else {
            self.core.background()
        });
        self.execute(cmds);
    }

    fn handle(&mut self, event: DriverEvent) {
        let cmds = match event {
            DriverEvent::Connect => self.core.request_connect(),
            DriverEvent::Disconnect => self.core.disconnect(),
            DriverEvent::Reconnect => self.core.reconnect(),
            DriverEvent::Subscribe(channels) => self.core.subscribe(&channels),
            DriverEvent::Unsubscribe(channels) => self.core.unsubscribe(&channels),
            DriverEvent::Opened {
                generation,
                outgoing,
            } => {
                if !self.core.is_current(generation) {
                    // Dropping the sender ends the superseded writer.
                    return;
                }
                if let Some(socket) = self.socket.as_mut() {
                    if socket.generation == generation {
                        socket.outgoing = Some(outgoing);
                    }
                }
                self.core.opened(generation)
            }
            DriverEvent::ConnectFailed {
                generation,
                failure,
            } => self.core.connect_failed(generation, failure),
            DriverEvent::Frame { generation, text } => match parse_server_message(&text) {
                Ok(message) => self.core.message(generation, message, UnixTimeMs::now()),
                Err(WireError::UnknownType(kind)) => {
                    debug!(kind = %kind, "ignoring unknown realtime message type");
                    Vec::new()
                }
                Err(e) => {
                    warn!(error = %e, "ignoring malformed realtime message");
                    Vec::new()
                }
            },
            DriverEvent::SocketError {
                generation,
                message,
            } => self.core.socket_error(generation, &message),
            DriverEvent::Closed {
                generation,
                code,
                reason,
            } => {
                let cmds = self.core.closed(generation, code, &reason);
                if self.core.is_current(generation) {
                    self.socket = None;
                }
                cmds
            }
            DriverEvent::ReconnectTimer => {
                self.reconnect_timer = None;
                self.core.reconnect_timer_fired()
            }
            DriverEvent::KeepAliveTick => self.core.keep_alive_tick(UnixTimeMs::now()),
            DriverEvent::Shutdown => Vec::new(),
        };
        self.execute(cmds);
    }

    fn execute(&mut self, cmds: Vec<ChannelCommand>) {
        for cmd in cmds {
            match cmd {
                ChannelCommand::Open { generation } => self.open(generation),
                ChannelCommand::Close { code } => self.close_socket(code),
                ChannelCommand::Send(message) => self.send_message(&message),
                ChannelCommand::ScheduleReconnect(delay) => {
                    abort(&mut self.reconnect_timer);
                    let events = self.events.clone();
                    self.reconnect_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events.send(DriverEvent::ReconnectTimer);
                    }));
                }
                ChannelCommand::CancelReconnect => abort(&mut self.reconnect_timer),
                ChannelCommand::StartKeepAlive => {
                    abort(&mut self.keep_alive);
                    let events = self.events.clone();
                    let period = self.config.ping_interval();
                    self.keep_alive = Some(tokio::spawn(async move {
                        let start = tokio::time::Instant::now() + period;
                        let mut ticker = tokio::time::interval_at(start, period);
                        loop {
                            ticker.tick().await;
                            if events.send(DriverEvent::KeepAliveTick).is_err() {
                                break;
                            }
                        }
                    }));
                }
                ChannelCommand::StopKeepAlive => abort(&mut self.keep_alive),
                ChannelCommand::SyncOfflineQueue => self.sync_offline_queue(),
            }
        }
        self.snapshot_tx.send_replace(self.core.snapshot());
    }

    fn open(&mut self, generation: u64) {
        if let Some(old) = self.socket.take() {
            old.task.abort();
        }

        let endpoint = self.deps.endpoint.clone();
        let credentials = Arc::clone(&self.deps.credentials);
        let require_permission = self.config.require_read_permission;
        let timeout = self.config.connect_timeout();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            let failure = |failure| DriverEvent::ConnectFailed {
                generation,
                failure,
            };

            let Some(creds) = credentials.credentials().await else {
                let _ = events.send(failure(ConnectFailure::MissingCredentials));
                return;
            };
            if require_permission {
                if let Some(snapshot) = credentials.permissions().await {
                    if !snapshot.can_read_steps() {
                        let _ = events.send(failure(ConnectFailure::PermissionDenied));
                        return;
                    }
                }
            }

            let url = match endpoint.websocket_url(&creds) {
                Ok(url) => url,
                Err(e) => {
                    let _ = events.send(failure(ConnectFailure::Transport(e.to_string())));
                    return;
                }
            };
            if let Ok(redacted) = endpoint.websocket_url_redacted() {
                debug!(url = %redacted, generation, "connecting realtime socket");
            }

            let stream =
                match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
                    .await
                {
                    Ok(Ok((stream, _response))) => stream,
                    Ok(Err(e)) => {
                        let _ = events.send(failure(ConnectFailure::Transport(e.to_string())));
                        return;
                    }
                    Err(_) => {
                        let _ = events.send(failure(ConnectFailure::Transport(format!(
                            "handshake timed out after {}ms",
                            timeout.as_millis()
                        ))));
                        return;
                    }
                };

            let (mut sink, mut source) = stream.split();
            let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

            tokio::spawn(async move {
                while let Some(message) = outgoing_rx.recv().await {
                    if let Err(e) = sink.send(message).await {
                        debug!(error = %e, "realtime socket write failed");
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            if events
                .send(DriverEvent::Opened {
                    generation,
                    outgoing,
                })
                .is_err()
            {
                return;
            }

            let (code, reason) = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(DriverEvent::Frame { generation, text });
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                            None => (CLOSE_NORMAL, String::new()),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(DriverEvent::SocketError {
                            generation,
                            message: e.to_string(),
                        });
                        break (CLOSE_ABNORMAL, e.to_string());
                    }
                    None => break (CLOSE_ABNORMAL, "stream ended".to_string()),
                }
            };

            let _ = events.send(DriverEvent::Closed {
                generation,
                code,
                reason,
            });
        });

        self.socket = Some(ActiveSocket {
            generation,
            task,
            outgoing: None,
        });
    }

    fn close_socket(&mut self, code: u16) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        socket.task.abort();
        if let Some(outgoing) = socket.outgoing {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            };
            let _ = outgoing.send(Message::Close(Some(frame)));
        }
        debug!(generation = socket.generation, code, "realtime socket closed by client");
    }

    fn send_message(&self, message: &ClientMessage) {
        let Some(outgoing) = self.socket.as_ref().and_then(|s| s.outgoing.as_ref()) else {
            debug!(?message, "no open socket, dropping outgoing message");
            return;
        };
        match message.to_json() {
            Ok(json) => {
                if outgoing.send(Message::Text(json)).is_err() {
                    debug!("realtime writer gone, message dropped");
                }
            }
            Err(e) => error!(error = %e, "failed to encode realtime message"),
        }
    }

    fn sync_offline_queue(&mut self) {
        if self
            .sync_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            debug!("offline queue sync already running");
            return;
        }

        let sync = Arc::clone(&self.deps.sync);
        let api = Arc::clone(&self.deps.api);
        let max_retries = self.deps.sync_max_retries;

        self.sync_task = Some(tokio::spawn(async move {
            let outcome = sync
                .sync_with_retry(
                    |req| {
                        let api = Arc::clone(&api);
                        async move { api.post_steps(req.delta, &req.idempotency_key).await }
                    },
                    max_retries,
                )
                .await;
            match outcome {
                SyncOutcome::NothingToSync => debug!("offline queue empty on connect"),
                SyncOutcome::Synced { server_total, .. } => {
                    info!(server_total, "offline queue synced on connect")
                }
                SyncOutcome::Failed { error, attempts } => {
                    warn!(error = %error, attempts, "offline queue sync on connect failed")
                }
            }
        }));
    }

    fn teardown(&mut self) {
        let mut cmds = self.core.disconnect();
        cmds.retain(|c| !matches!(c, ChannelCommand::Open { .. }));
        self.execute(cmds);
        abort(&mut self.reconnect_timer);
        abort(&mut self.keep_alive);
        abort(&mut self.sync_task);
    }
}

fn abort(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::credentials::{Credentials, PermissionSnapshot, StaticCredentials};
    use crate::capabilities::kv::MemoryKv;
    use crate::capabilities::lifecycle::LifecycleHub;
    use crate::config::{QueueConfig, SyncConfig};
    use crate::offline_store::DurableQueueStore;
    use crate::queue::StepQueue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingApi {
        calls: AtomicU32,
    }

    #[async_trait]
    impl StepsApi for CountingApi {
        async fn post_steps(&self, delta: i64, _key: &IdempotencyKey) -> Result<i64, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(1_000 + delta)
        }
    }

    fn channel_with(credentials: StaticCredentials) -> (RealtimeChannel, Arc<CountingApi>) {
        let queue = Arc::new(StepQueue::new(
            DurableQueueStore::new(Arc::new(MemoryKv::new())),
            QueueConfig::default(),
        ));
        let api = Arc::new(CountingApi {
            calls: AtomicU32::new(0),
        });
        let deps = ChannelDeps {
            endpoint: ApiEndpoint::new("https://api.example.org").unwrap(),
            credentials: Arc::new(credentials),
            api: api.clone(),
            sync: Arc::new(SyncEngine::new(queue, SyncConfig::default())),
            lifecycle: LifecycleHub::shared(),
            sync_max_retries: 3,
        };
        (RealtimeChannel::spawn(RealtimeConfig::default(), deps), api)
    }

    async fn wait_for(channel: &RealtimeChannel, state: ConnectionState) {
        let mut rx = channel.watch();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .expect("state not reached")
            .expect("driver stopped");
    }

    #[tokio::test]
    async fn test_missing_credentials_enters_error_state() {
        let (channel, _) = channel_with(StaticCredentials::none());
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        channel.connect().unwrap();
        wait_for(&channel, ConnectionState::Error).await;
        assert_eq!(
            channel.snapshot().last_error.as_deref(),
            Some("missing auth credentials")
        );
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_permission_stays_disconnected() {
        let creds = StaticCredentials::new(Credentials::new("tok", "u1"))
            .with_permissions(PermissionSnapshot::default());
        let (channel, _) = channel_with(creds);

        channel.connect().unwrap();
        let mut rx = channel.watch();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.last_error.is_some()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_steps_while_disconnected_queues() {
        let (channel, api) = channel_with(StaticCredentials::none());

        let delivery = channel.sync_steps(25).await.unwrap();
        let StepsDelivery::Queued { id } = delivery else {
            panic!("expected queued delivery");
        };
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);

        let items = channel.sync.queue().unsynced_steps().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert_eq!(items[0].delta, 25);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_steps_reports_discarded_when_queue_is_full() {
        let (channel, _) = channel_with(StaticCredentials::none());
        let queue = channel.sync.queue();
        for _ in 0..queue.config().capacity {
            queue.queue_steps(1, Priority::Critical, None).await;
        }

        let delivery = channel.sync_steps(25).await.unwrap();
        assert_eq!(delivery, StepsDelivery::Discarded);
        assert_eq!(
            queue.total_unsynced_delta().await,
            i64::try_from(queue.config().capacity).unwrap()
        );
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_push_source_view() {
        let (channel, _) = channel_with(StaticCredentials::none());
        let source: &dyn PushSource<TotalUpdate> = &channel;
        assert!(!source.is_connected());
        assert_eq!(source.latest(), None);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_report_stopped() {
        let (channel, _) = channel_with(StaticCredentials::none());
        channel.shutdown().await;
        assert!(matches!(channel.connect(), Err(ChannelError::Stopped)));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }
}
