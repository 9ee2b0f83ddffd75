//! Connection state machine for the realtime channel.
//!
//! [`ChannelCore`] is synchronous and owns no I/O. Each input returns the
//! [`ChannelCommand`]s the driver must execute, in order. Every socket attempt
//! carries a generation number so events from a superseded socket are dropped.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::event::{
    BadgeEarned, ClientMessage, LeaderboardUpdate, ServerMessage, StepUpdate, TotalUpdate,
};
use crate::model::UnixTimeMs;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_SERVER_ERROR: u16 = 1011;

pub fn describe_close(code: u16) -> &'static str {
    match code {
        CLOSE_NORMAL => "normal closure",
        CLOSE_ABNORMAL => "abnormal closure",
        CLOSE_POLICY_VIOLATION => "policy violation",
        CLOSE_SERVER_ERROR => "server error",
        _ => "other",
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    /// `min(base * 2^attempts, max)`
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl From<&RealtimeConfig> for ReconnectPolicy {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_ms),
            max: Duration::from_millis(config.reconnect_max_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectFailure {
    MissingCredentials,
    PermissionDenied,
    /// Handshake, DNS or timeout failure.
    Transport(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelCommand {
    Open { generation: u64 },
    Close { code: u16 },
    Send(ClientMessage),
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartKeepAlive,
    StopKeepAlive,
    SyncOfflineQueue,
}

/// Latest pushed data, one slot per message kind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelData {
    pub step_update: Option<StepUpdate>,
    pub total: Option<TotalUpdate>,
    pub leaderboard: Option<LeaderboardUpdate>,
    pub last_badge: Option<BadgeEarned>,
    pub last_message_at: Option<UnixTimeMs>,
    pub last_pong_at: Option<UnixTimeMs>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelSnapshot {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub manual_disconnect: bool,
    pub subscriptions: Vec<String>,
    pub last_error: Option<String>,
    pub data: ChannelData,
}

#[derive(Debug)]
pub struct ChannelCore {
    policy: ReconnectPolicy,
    state: ConnectionState,
    reconnect_attempts: u32,
    manual_disconnect: bool,
    foreground: bool,
    online: bool,
    generation: u64,
    subscriptions: BTreeSet<String>,
    last_error: Option<String>,
    data: ChannelData,
}

impl ChannelCore {
    pub fn new(config: &RealtimeConfig, foreground: bool, online: bool) -> Self {
        Self {
            policy: ReconnectPolicy::from(config),
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            manual_disconnect: false,
            foreground,
            online,
            generation: 0,
            subscriptions: config.channels.iter().cloned().collect(),
            last_error: None,
            data: ChannelData::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    pub fn data(&self) -> &ChannelData {
        &self.data
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            manual_disconnect: self.manual_disconnect,
            subscriptions: self.subscriptions.iter().cloned().collect(),
            last_error: self.last_error.clone(),
            data: self.data.clone(),
        }
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        )
    }

    fn can_auto_connect(&self) -> bool {
        !self.manual_disconnect && self.foreground && self.online
    }

    fn begin_connect(&mut self) -> Vec<ChannelCommand> {
        if self.is_live() {
            return Vec::new();
        }
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        debug!(generation = self.generation, "opening realtime socket");
        vec![
            ChannelCommand::CancelReconnect,
            ChannelCommand::Open {
                generation: self.generation,
            },
        ]
    }

    /// Drops the live socket, if any, without touching the manual flag.
    fn drop_socket(&mut self) -> Vec<ChannelCommand> {
        let had_socket = self.is_live();
        self.generation += 1;
        self.state = ConnectionState::Disconnected;

        let mut cmds = vec![ChannelCommand::CancelReconnect, ChannelCommand::StopKeepAlive];
        if had_socket {
            cmds.push(ChannelCommand::Close { code: CLOSE_NORMAL });
        }
        cmds
    }

    // ===== Public requests =====

    /// An explicit connect also clears an earlier manual disconnect.
    pub fn request_connect(&mut self) -> Vec<ChannelCommand> {
        self.manual_disconnect = false;
        self.begin_connect()
    }

    pub fn disconnect(&mut self) -> Vec<ChannelCommand> {
        info!("realtime channel manually disconnected");
        self.manual_disconnect = true;
        self.reconnect_attempts = 0;
        self.drop_socket()
    }

    pub fn reconnect(&mut self) -> Vec<ChannelCommand> {
        info!("realtime channel reconnect requested");
        self.manual_disconnect = false;
        self.reconnect_attempts = 0;
        let mut cmds = self.drop_socket();
        cmds.extend(self.begin_connect());
        cmds
    }

    pub fn subscribe(&mut self, channels: &[String]) -> Vec<ChannelCommand> {
        let added: Vec<String> = channels
            .iter()
            .filter(|c| self.subscriptions.insert((*c).clone()))
            .cloned()
            .collect();
        if added.is_empty() || self.state != ConnectionState::Connected {
            return Vec::new();
        }
        vec![ChannelCommand::Send(ClientMessage::Subscribe { channels: added })]
    }

    pub fn unsubscribe(&mut self, channels: &[String]) -> Vec<ChannelCommand> {
        let removed: Vec<String> = channels
            .iter()
            .filter(|c| self.subscriptions.remove(c.as_str()))
            .cloned()
            .collect();
        if removed.is_empty() || self.state != ConnectionState::Connected {
            return Vec::new();
        }
        vec![ChannelCommand::Send(ClientMessage::Unsubscribe {
            channels: removed,
        })]
    }

    // ===== Lifecycle =====

    pub fn foreground(&mut self) -> Vec<ChannelCommand> {
        self.foreground = true;
        if self.can_auto_connect() {
            self.begin_connect()
        } else {
            Vec::new()
        }
    }

    /// Backgrounding closes the socket but is not a manual disconnect.
    pub fn background(&mut self) -> Vec<ChannelCommand> {
        self.foreground = false;
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        debug!("app backgrounded, closing realtime channel");
        self.drop_socket()
    }

    pub fn network_changed(&mut self, online: bool) -> Vec<ChannelCommand> {
        self.online = online;
        if !online {
            if self.state == ConnectionState::Disconnected {
                return Vec::new();
            }
            debug!("network lost, closing realtime channel");
            return self.drop_socket();
        }
        if self.can_auto_connect() {
            self.begin_connect()
        } else {
            Vec::new()
        }
    }

    // ===== Socket events =====

    pub fn opened(&mut self, generation: u64) -> Vec<ChannelCommand> {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        info!(generation, "realtime channel connected");
        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.last_error = None;

        let mut cmds = vec![ChannelCommand::CancelReconnect];
        if !self.subscriptions.is_empty() {
            cmds.push(ChannelCommand::Send(ClientMessage::Subscribe {
                channels: self.subscriptions.iter().cloned().collect(),
            }));
        }
        cmds.push(ChannelCommand::StartKeepAlive);
        cmds.push(ChannelCommand::SyncOfflineQueue);
        cmds
    }

    pub fn connect_failed(&mut self, generation: u64, failure: ConnectFailure) -> Vec<ChannelCommand> {
        if !self.is_current(generation) {
            return Vec::new();
        }
        match failure {
            ConnectFailure::MissingCredentials => {
                warn!("no auth credentials, realtime channel not connecting");
                self.state = ConnectionState::Error;
                self.last_error = Some("missing auth credentials".to_string());
                Vec::new()
            }
            ConnectFailure::PermissionDenied => {
                info!("steps:read not granted, realtime channel not connecting");
                self.state = ConnectionState::Disconnected;
                self.last_error = Some("missing steps:read permission".to_string());
                Vec::new()
            }
            ConnectFailure::Transport(reason) => self.closed(generation, CLOSE_ABNORMAL, &reason),
        }
    }

    pub fn socket_error(&mut self, generation: u64, message: &str) -> Vec<ChannelCommand> {
        if self.is_current(generation) {
            warn!(generation, error = message, "realtime socket error");
            self.last_error = Some(message.to_string());
        }
        Vec::new()
    }

    /// Any close of the current socket reconnects with backoff unless the
    /// channel was manually disconnected, the app is backgrounded or offline.
    pub fn closed(&mut self, generation: u64, code: u16, reason: &str) -> Vec<ChannelCommand> {
        if !self.is_current(generation) {
            debug!(generation, code, "ignoring close from superseded socket");
            return Vec::new();
        }

        match code {
            CLOSE_NORMAL => info!(code, reason, "realtime channel closed normally"),
            CLOSE_POLICY_VIOLATION => {
                warn!(code, reason, "realtime channel closed: policy violation or auth rejected")
            }
            CLOSE_SERVER_ERROR => warn!(code, reason, "realtime channel closed: server error"),
            CLOSE_ABNORMAL => warn!(code, reason, "realtime channel closed abnormally"),
            _ => warn!(code, reason, kind = describe_close(code), "realtime channel closed"),
        }
        if code != CLOSE_NORMAL && !reason.is_empty() {
            self.last_error = Some(format!("{} ({}): {}", describe_close(code), code, reason));
        }

        let mut cmds = vec![ChannelCommand::StopKeepAlive];
        if !self.can_auto_connect() {
            self.state = ConnectionState::Disconnected;
            return cmds;
        }

        let delay = self.policy.delay(self.reconnect_attempts);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.state = ConnectionState::Reconnecting;
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.reconnect_attempts,
            "scheduling realtime reconnect"
        );
        cmds.push(ChannelCommand::ScheduleReconnect(delay));
        cmds
    }

    pub fn reconnect_timer_fired(&mut self) -> Vec<ChannelCommand> {
        if self.state != ConnectionState::Reconnecting || !self.can_auto_connect() {
            return Vec::new();
        }
        self.begin_connect()
    }

    pub fn keep_alive_tick(&mut self, now: UnixTimeMs) -> Vec<ChannelCommand> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        vec![ChannelCommand::Send(ClientMessage::Ping { timestamp: now })]
    }

    pub fn message(
        &mut self,
        generation: u64,
        message: ServerMessage,
        now: UnixTimeMs,
    ) -> Vec<ChannelCommand> {
        if !self.is_current(generation) {
            return Vec::new();
        }
        self.data.last_message_at = Some(now);

        match message {
            ServerMessage::StepUpdate(update) => self.data.step_update = Some(update),
            ServerMessage::TotalUpdate(total) => {
                debug!(total_steps = total.total_steps, "total update");
                self.data.total = Some(total);
            }
            ServerMessage::LeaderboardUpdate(board) => self.data.leaderboard = Some(board),
            ServerMessage::BadgeEarned(badge) => {
                info!(badge = %badge.badge_name, participant_id = %badge.participant_id, "badge earned");
                self.data.last_badge = Some(badge);
            }
            ServerMessage::Ping { .. } => {
                return vec![ChannelCommand::Send(ClientMessage::Pong { timestamp: now })];
            }
            ServerMessage::Pong { .. } => self.data.last_pong_at = Some(now),
            ServerMessage::Welcome { message, .. } => {
                debug!(message = message.as_deref().unwrap_or(""), "server welcome");
            }
        }
        Vec::new()
    }
}
