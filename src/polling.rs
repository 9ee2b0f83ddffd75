//! Periodic refresh for data views that have no live push channel.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capabilities::http::TransportError;
use crate::capabilities::lifecycle::{self, LifecycleEvent, LifecycleSource};
use crate::config::{ConfigError, PollingConfig};
use crate::model::UnixTimeMs;

/// A push channel that can stand in for polling while it is connected.
pub trait PushSource<T>: Send + Sync {
    fn connect(&self);
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn latest(&self) -> Option<T>;
}

// ============================================================================
// Backoff
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffStep {
    RetryAfter(Duration),
    /// `max_retries` consecutive failures; wait this long, then start over.
    Cooldown(Duration),
}

impl BackoffStep {
    pub fn delay(self) -> Duration {
        match self {
            BackoffStep::RetryAfter(d) | BackoffStep::Cooldown(d) => d,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollBackoff {
    retry_delay: Duration,
    max_backoff: Duration,
    cooldown: Duration,
    max_retries: u32,
    failures: u32,
}

impl PollBackoff {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            cooldown: Duration::from_millis(config.cooldown_ms),
            max_retries: config.max_retries,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// `retry_delay * 2^(failures - 1)` capped at `max_backoff`, or a cooldown
    /// once `max_retries` consecutive failures have been seen.
    pub fn record_failure(&mut self) -> BackoffStep {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_retries {
            return BackoffStep::Cooldown(self.cooldown);
        }
        let exponent = (self.failures - 1).min(16);
        let delay = self.retry_delay.saturating_mul(1u32 << exponent);
        BackoffStep::RetryAfter(delay.min(self.max_backoff))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollSource {
    Fetch,
    Push,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollState<T> {
    pub data: Option<T>,
    pub error: Option<String>,
    pub is_loading: bool,
    pub is_paused: bool,
    pub retry_attempt: u32,
    pub source: Option<PollSource>,
    pub last_updated: Option<UnixTimeMs>,
}

impl<T> Default for PollState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            is_paused: false,
            retry_attempt: 0,
            source: None,
            last_updated: None,
        }
    }
}

pub struct PollCallbacks<T> {
    pub on_success: Option<Box<dyn Fn(&T) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(&TransportError) + Send + Sync>>,
    pub on_max_retries: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<T> Default for PollCallbacks<T> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
            on_max_retries: None,
        }
    }
}

pub struct PollingOptions<T> {
    pub config: PollingConfig,
    pub lifecycle: Option<Arc<dyn LifecycleSource>>,
    pub push: Option<Arc<dyn PushSource<T>>>,
    /// The engine connects the push source on start and disconnects it on stop.
    pub owns_push: bool,
    pub callbacks: PollCallbacks<T>,
}

impl<T> PollingOptions<T> {
    pub fn new(config: PollingConfig) -> Self {
        Self {
            config,
            lifecycle: None,
            push: None,
            owns_push: false,
            callbacks: PollCallbacks::default(),
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn LifecycleSource>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn with_push(mut self, push: Arc<dyn PushSource<T>>) -> Self {
        self.push = Some(push);
        self
    }
}

// ============================================================================
// Engine
// ============================================================================

enum PollCommand {
    ForceRefetch,
    Stop,
}

type FetchFn<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, TransportError>> + Send + Sync>;

pub struct PollingEngine<T> {
    state: watch::Receiver<PollState<T>>,
    commands: mpsc::UnboundedSender<PollCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> std::fmt::Debug for PollingEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingEngine").finish_non_exhaustive()
    }
}

impl<T> PollingEngine<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn spawn<F, Fut>(fetch: F, options: PollingOptions<T>) -> Result<Self, ConfigError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        options.config.validate()?;

        let paused = options
            .lifecycle
            .as_ref()
            .map(|l| l.snapshot())
            .is_some_and(|snap| is_paused(&options.config, snap.is_foreground(), snap.online));

        let (state_tx, state) = watch::channel(PollState {
            is_paused: paused,
            ..PollState::default()
        });
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let poller = Poller {
            fetch: Box::new(move || fetch().boxed()),
            backoff: PollBackoff::from_config(&options.config),
            lifecycle_rx: options.lifecycle.as_ref().map(|l| l.subscribe()),
            lifecycle: options.lifecycle,
            push: options.push,
            owns_push: options.owns_push,
            callbacks: options.callbacks,
            config: options.config,
            paused,
            in_cooldown: false,
            state: state_tx,
        };
        let task = tokio::spawn(poller.run(commands_rx));

        Ok(Self {
            state,
            commands,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn state(&self) -> PollState<T> {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PollState<T>> {
        self.state.clone()
    }

    /// Resets backoff and fetches now, even while paused or cooling down.
    pub fn force_refetch(&self) {
        let _ = self.commands.send(PollCommand::ForceRefetch);
    }

    pub async fn stop(&self) {
        let _ = self.commands.send(PollCommand::Stop);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl<T> Drop for PollingEngine<T> {
    fn drop(&mut self) {
        let _ = self.commands.send(PollCommand::Stop);
    }
}

fn is_paused(config: &PollingConfig, foreground: bool, online: bool) -> bool {
    (config.pause_when_offline && !online) || (config.pause_in_background && !foreground)
}

struct Poller<T> {
    fetch: FetchFn<T>,
    backoff: PollBackoff,
    lifecycle: Option<Arc<dyn LifecycleSource>>,
    lifecycle_rx: Option<broadcast::Receiver<LifecycleEvent>>,
    push: Option<Arc<dyn PushSource<T>>>,
    owns_push: bool,
    callbacks: PollCallbacks<T>,
    config: PollingConfig,
    paused: bool,
    in_cooldown: bool,
    state: watch::Sender<PollState<T>>,
}

impl<T> Poller<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn should_poll(&self) -> bool {
        self.config.enabled && !self.paused
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PollCommand>) {
        if self.owns_push {
            if let Some(push) = &self.push {
                push.connect();
            }
        }

        let mut next = self.should_poll().then(Instant::now);

        loop {
            let wake = async move {
                match next {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = wake => {
                    next = self.cycle().await;
                }
                command = commands.recv() => match command {
                    Some(PollCommand::ForceRefetch) => {
                        debug!("forced refetch");
                        self.backoff.reset();
                        self.in_cooldown = false;
                        next = self.cycle().await;
                    }
                    Some(PollCommand::Stop) | None => break,
                },
                event = lifecycle::next_event(&mut self.lifecycle_rx) => {
                    let was_paused = self.paused;
                    match event {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => self.refresh_paused(),
                        Err(broadcast::error::RecvError::Closed) => self.lifecycle_rx = None,
                    }
                    if self.paused && !was_paused {
                        info!("polling paused");
                        next = None;
                    } else if !self.paused && was_paused {
                        info!("polling resumed");
                        next = self.should_poll().then(Instant::now);
                    }
                }
            }

            if !self.should_poll() {
                next = None;
            }
        }

        if self.owns_push {
            if let Some(push) = &self.push {
                push.disconnect();
            }
        }
        debug!("polling stopped");
    }

    fn refresh_paused(&mut self) {
        if let Some(lifecycle) = &self.lifecycle {
            let snapshot = lifecycle.snapshot();
            let paused = is_paused(&self.config, snapshot.is_foreground(), snapshot.online);
            self.paused = paused;
            self.state.send_modify(|s| s.is_paused = paused);
        }
    }

    /// One refresh. Returns when the next one is due.
    async fn cycle(&mut self) -> Option<Instant> {
        if self.in_cooldown {
            self.in_cooldown = false;
            self.backoff.reset();
        }

        if let Some(data) = self
            .push
            .as_ref()
            .filter(|p| p.is_connected())
            .and_then(|p| p.latest())
        {
            self.backoff.reset();
            self.state.send_modify(|s| {
                s.data = Some(data);
                s.error = None;
                s.retry_attempt = 0;
                s.source = Some(PollSource::Push);
                s.last_updated = Some(UnixTimeMs::now());
            });
            return Some(Instant::now() + self.config.interval());
        }

        self.state.send_modify(|s| s.is_loading = true);
        let timeout = self.config.fetch_timeout();
        let result = match tokio::time::timeout(timeout, (self.fetch)()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(data) => {
                self.backoff.reset();
                if let Some(on_success) = &self.callbacks.on_success {
                    on_success(&data);
                }
                self.state.send_modify(|s| {
                    s.data = Some(data);
                    s.error = None;
                    s.is_loading = false;
                    s.retry_attempt = 0;
                    s.source = Some(PollSource::Fetch);
                    s.last_updated = Some(UnixTimeMs::now());
                });
                Some(Instant::now() + self.config.interval())
            }
            Err(e) => {
                if let Some(on_error) = &self.callbacks.on_error {
                    on_error(&e);
                }
                let step = self.backoff.record_failure();
                let attempt = self.backoff.failures();
                self.state.send_modify(|s| {
                    s.error = Some(e.to_string());
                    s.is_loading = false;
                    s.retry_attempt = attempt;
                });

                if let BackoffStep::Cooldown(cooldown) = step {
                    warn!(
                        failures = attempt,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "polling hit max retries, cooling down"
                    );
                    if let Some(on_max_retries) = &self.callbacks.on_max_retries {
                        on_max_retries();
                    }
                    self.in_cooldown = true;
                } else {
                    debug!(error = %e, attempt, "poll failed, backing off");
                }
                Some(Instant::now() + step.delay())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::lifecycle::LifecycleHub;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn config() -> PollingConfig {
        PollingConfig::with_interval(Duration::from_secs(30))
    }

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = PollBackoff::from_config(&PollingConfig::default());
        assert_eq!(backoff.record_failure(), BackoffStep::RetryAfter(Duration::from_secs(1)));
        assert_eq!(backoff.record_failure(), BackoffStep::RetryAfter(Duration::from_secs(2)));
        assert_eq!(backoff.record_failure(), BackoffStep::Cooldown(Duration::from_secs(120)));
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.record_failure(), BackoffStep::RetryAfter(Duration::from_secs(1)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = PollBackoff::from_config(&PollingConfig {
            max_retries: 10,
            ..PollingConfig::default()
        });
        let delays: Vec<Duration> = (0..9).map(|_| backoff.record_failure().delay()).collect();
        assert_eq!(delays[5], Duration::from_secs(32));
        assert_eq!(delays[6], Duration::from_secs(60));
        assert_eq!(delays[8], Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval() {
        let calls = counter();
        let c = calls.clone();
        let engine = PollingEngine::spawn(
            move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<u32, TransportError>(n) }
            },
            PollingOptions::new(config()),
        )
        .unwrap();

        advance(10).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let state = engine.state();
        assert_eq!(state.data, Some(0));
        assert_eq!(state.source, Some(PollSource::Fetch));
        assert!(!state.is_loading);

        advance(30_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        advance(30_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        engine.stop().await;
        advance(120_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_backoff_cooldown_and_recovery() {
        let calls = counter();
        let max_hits = counter();
        let errors = counter();

        let c = calls.clone();
        let m = max_hits.clone();
        let e = errors.clone();
        let mut options = PollingOptions::new(config());
        options.callbacks.on_max_retries = Some(Box::new(move || {
            m.fetch_add(1, Ordering::SeqCst);
        }));
        options.callbacks.on_error = Some(Box::new(move |_: &TransportError| {
            e.fetch_add(1, Ordering::SeqCst);
        }));

        let engine = PollingEngine::spawn(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<u32, _>(TransportError::Connection {
                        message: "down".into(),
                    })
                }
            },
            options,
        )
        .unwrap();

        // t=0 fail, t=1s fail, t=3s fail -> cooldown
        advance(500).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state().retry_attempt, 1);
        advance(1_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        advance(2_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(max_hits.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 3);

        // quiet through the cooldown
        advance(100_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // cooldown ends at t=123s and the schedule starts over
        advance(20_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(engine.state().retry_attempt, 1);
        advance(1_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(engine.state().error.is_some());

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refetch_skips_backoff() {
        let calls = counter();
        let fail = Arc::new(AtomicBool::new(true));

        let c = calls.clone();
        let f = fail.clone();
        let engine = PollingEngine::spawn(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                let fail = f.load(Ordering::SeqCst);
                async move {
                    if fail {
                        Err(TransportError::Timeout { timeout_ms: 1 })
                    } else {
                        Ok(7u32)
                    }
                }
            },
            PollingOptions::new(config()),
        )
        .unwrap();

        advance(10).await;
        assert_eq!(engine.state().retry_attempt, 1);

        fail.store(false, Ordering::SeqCst);
        engine.force_refetch();
        advance(10).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let state = engine.state();
        assert_eq!(state.data, Some(7));
        assert_eq!(state.retry_attempt, 0);
        assert_eq!(state.error, None);

        engine.stop().await;
    }

    struct FakePush {
        connected: AtomicBool,
        value: Mutex<Option<u32>>,
        connects: AtomicU32,
        disconnects: AtomicU32,
    }

    impl PushSource<u32> for FakePush {
        fn connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn latest(&self) -> Option<u32> {
            *self.value.lock().unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_data_replaces_fetch() {
        let push = Arc::new(FakePush {
            connected: AtomicBool::new(true),
            value: Mutex::new(Some(99)),
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
        });
        let calls = counter();
        let c = calls.clone();

        let mut options = PollingOptions::new(config()).with_push(push.clone());
        options.owns_push = true;
        let engine = PollingEngine::spawn(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u32, TransportError>(1) }
            },
            options,
        )
        .unwrap();

        advance(10).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.state().data, Some(99));
        assert_eq!(engine.state().source, Some(PollSource::Push));
        assert_eq!(push.connects.load(Ordering::SeqCst), 1);

        // push drops, polling takes over on the next tick
        push.connected.store(false, Ordering::SeqCst);
        advance(30_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state().source, Some(PollSource::Fetch));

        engine.stop().await;
        assert_eq!(push.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pauses_offline_and_resumes_with_fetch() {
        let hub = LifecycleHub::shared();
        let calls = counter();
        let c = calls.clone();

        let engine = PollingEngine::spawn(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u32, TransportError>(1) }
            },
            PollingOptions::new(config()).with_lifecycle(hub.clone()),
        )
        .unwrap();

        advance(10).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        hub.set_online(false);
        advance(10).await;
        assert!(engine.state().is_paused);
        advance(120_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        hub.set_online(true);
        advance(10).await;
        assert!(!engine.state().is_paused);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        hub.set_app_state(crate::capabilities::lifecycle::AppState::Background);
        advance(60_000).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = PollingEngine::spawn(
            || async { Ok::<u32, TransportError>(1) },
            PollingOptions::new(PollingConfig {
                interval_ms: 0,
                ..PollingConfig::default()
            }),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
