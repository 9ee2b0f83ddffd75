//! App foreground/background and network reachability, as reported by the host.
//!
//! The host shell owns a [`LifecycleHub`] and pushes platform callbacks into it;
//! the realtime channel and the polling engine subscribe to its events.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    #[default]
    Active,
    Background,
    Inactive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Foreground,
    Background,
    NetworkChanged { online: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    pub app_state: AppState,
    pub online: bool,
}

impl LifecycleSnapshot {
    pub fn is_foreground(&self) -> bool {
        self.app_state == AppState::Active
    }
}

impl Default for LifecycleSnapshot {
    fn default() -> Self {
        Self {
            app_state: AppState::Active,
            online: true,
        }
    }
}

pub trait LifecycleSource: Send + Sync {
    fn snapshot(&self) -> LifecycleSnapshot;
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent>;
}

const EVENT_CAPACITY: usize = 32;

#[derive(Debug)]
pub struct LifecycleHub {
    current: Mutex<LifecycleSnapshot>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Default for LifecycleHub {
    fn default() -> Self {
        Self::new(LifecycleSnapshot::default())
    }
}

impl LifecycleHub {
    pub fn new(initial: LifecycleSnapshot) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            current: Mutex::new(initial),
            events,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `Inactive` updates the snapshot but emits nothing; only transitions
    /// into `Active` or `Background` are acted upon.
    pub fn set_app_state(&self, state: AppState) {
        let changed = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = current.app_state != state;
            current.app_state = state;
            changed
        };
        if !changed {
            return;
        }

        debug!(?state, "app state changed");
        let event = match state {
            AppState::Active => LifecycleEvent::Foreground,
            AppState::Background => LifecycleEvent::Background,
            AppState::Inactive => return,
        };
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn set_online(&self, online: bool) {
        let changed = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = current.online != online;
            current.online = online;
            changed
        };
        if changed {
            debug!(online, "network reachability changed");
            let _ = self.events.send(LifecycleEvent::NetworkChanged { online });
        }
    }
}

impl LifecycleSource for LifecycleHub {
    fn snapshot(&self) -> LifecycleSnapshot {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }
}

/// Next lifecycle event, or never once the subscription has been dropped.
pub(crate) async fn next_event(
    rx: &mut Option<broadcast::Receiver<LifecycleEvent>>,
) -> Result<LifecycleEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_only_on_change() {
        let hub = LifecycleHub::default();
        let mut rx = hub.subscribe();

        hub.set_app_state(AppState::Active);
        hub.set_app_state(AppState::Background);
        hub.set_online(true);
        hub.set_online(false);

        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::Background);
        assert_eq!(
            rx.recv().await.unwrap(),
            LifecycleEvent::NetworkChanged { online: false }
        );
        assert!(rx.try_recv().is_err());

        let snap = hub.snapshot();
        assert!(!snap.is_foreground());
        assert!(!snap.online);
    }

    #[tokio::test]
    async fn inactive_is_silent() {
        let hub = LifecycleHub::default();
        let mut rx = hub.subscribe();
        hub.set_app_state(AppState::Inactive);
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.snapshot().app_state, AppState::Inactive);

        hub.set_app_state(AppState::Active);
        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::Foreground);
    }
}
