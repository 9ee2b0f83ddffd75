#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use stepsync::capabilities::http::IdempotencyKey;
use stepsync::capabilities::lifecycle::{AppState, LifecycleSnapshot};
use stepsync::{LifecycleHub, StepsApi, TransportError};

/// Steps endpoint double: records every post and can fail the first N calls.
#[derive(Default)]
pub struct StubApi {
    pub posted: Mutex<Vec<i64>>,
    pub keys: Mutex<Vec<String>>,
    pub total: AtomicI64,
    pub failures_left: AtomicU32,
}

impl StubApi {
    pub fn with_total(total: i64) -> Arc<Self> {
        let api = Self::default();
        api.total.store(total, Ordering::SeqCst);
        Arc::new(api)
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn posted(&self) -> Vec<i64> {
        self.posted.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepsApi for StubApi {
    async fn post_steps(&self, delta: i64, key: &IdempotencyKey) -> Result<i64, TransportError> {
        self.keys.lock().unwrap().push(key.as_str().to_string());
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Connection {
                message: "connection refused".into(),
            });
        }
        self.posted.lock().unwrap().push(delta);
        Ok(self.total.fetch_add(delta, Ordering::SeqCst) + delta)
    }
}

pub fn offline_hub() -> Arc<LifecycleHub> {
    Arc::new(LifecycleHub::new(LifecycleSnapshot {
        app_state: AppState::Active,
        online: false,
    }))
}
