//! Crate configuration.
//!
//! Every section has production defaults; hosts usually ship a JSON document
//! with only the fields they want to override.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_attempts: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub cleanup_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1_000,
            cleanup_delay_ms: 60_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

pub const DEFAULT_CHANNELS: &[&str] = &[
    "step_updates",
    "total_updates",
    "leaderboard_updates",
    "badge_updates",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub ping_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub channels: Vec<String>,
    /// Skip connecting when a cached permission snapshot lacks `steps:read`.
    pub require_read_permission: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            ping_interval_ms: 30_000,
            connect_timeout_ms: 10_000,
            channels: DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect(),
            require_read_permission: true,
        }
    }
}

impl RealtimeConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub max_backoff_ms: u64,
    pub cooldown_ms: u64,
    pub fetch_timeout_ms: u64,
    pub enabled: bool,
    pub pause_when_offline: bool,
    pub pause_in_background: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            retry_delay_ms: 1_000,
            max_retries: 3,
            max_backoff_ms: 60_000,
            cooldown_ms: 120_000,
            fetch_timeout_ms: 30_000,
            enabled: true,
            pause_when_offline: true,
            pause_in_background: true,
        }
    }
}

impl PollingConfig {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(invalid("polling.interval_ms must be > 0"));
        }
        if self.retry_delay_ms == 0 {
            return Err(invalid("polling.retry_delay_ms must be > 0"));
        }
        if self.max_retries == 0 {
            return Err(invalid("polling.max_retries must be > 0"));
        }
        if self.max_backoff_ms < self.retry_delay_ms {
            return Err(invalid("polling.max_backoff_ms must be >= retry_delay_ms"));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(invalid("polling.fetch_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSyncConfig {
    pub api_base_url: String,
    pub queue: QueueConfig,
    pub sync: SyncConfig,
    pub realtime: RealtimeConfig,
    pub polling: PollingConfig,
}

impl Default for StepSyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.example.org".to_string(),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
            realtime: RealtimeConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl StepSyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.api_base_url)
            .map_err(|e| invalid(format!("api_base_url: {}", e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid(format!(
                "api_base_url scheme '{}' must be http or https",
                url.scheme()
            )));
        }

        if self.queue.capacity == 0 {
            return Err(invalid("queue.capacity must be > 0"));
        }
        if self.queue.max_attempts == 0 {
            return Err(invalid("queue.max_attempts must be > 0"));
        }

        if self.sync.max_retries == 0 {
            return Err(invalid("sync.max_retries must be > 0"));
        }
        if self.sync.base_backoff_ms == 0 {
            return Err(invalid("sync.base_backoff_ms must be > 0"));
        }
        if self.sync.request_timeout_ms == 0 {
            return Err(invalid("sync.request_timeout_ms must be > 0"));
        }

        if self.realtime.reconnect_base_ms == 0 {
            return Err(invalid("realtime.reconnect_base_ms must be > 0"));
        }
        if self.realtime.reconnect_max_ms < self.realtime.reconnect_base_ms {
            return Err(invalid(
                "realtime.reconnect_max_ms must be >= reconnect_base_ms",
            ));
        }
        if self.realtime.ping_interval_ms == 0 {
            return Err(invalid("realtime.ping_interval_ms must be > 0"));
        }
        if self.realtime.connect_timeout_ms == 0 {
            return Err(invalid("realtime.connect_timeout_ms must be > 0"));
        }

        self.polling.validate()
    }
}
