//! Realtime wire messages.
//!
//! Every frame is a JSON object discriminated by its `type` field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::UnixTimeMs;

/// Servers send either epoch milliseconds or a formatted date string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(i64),
    Text(String),
}

// --- Client -> server ---

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Ping { timestamp: UnixTimeMs },
    Pong { timestamp: UnixTimeMs },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// --- Server -> client ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepUpdate {
    pub participant_id: String,
    #[serde(rename = "naam", default)]
    pub name: Option<String>,
    pub steps: i64,
    #[serde(default)]
    pub delta: i64,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub allocated_funds: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
}

/// The authoritative running total.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalUpdate {
    pub total_steps: i64,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub participant_id: String,
    #[serde(rename = "naam", default)]
    pub name: Option<String>,
    pub steps: i64,
    #[serde(default)]
    pub achievement_points: i64,
    #[serde(default)]
    pub total_score: f64,
    #[serde(default)]
    pub route: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardUpdate {
    #[serde(default)]
    pub top_n: u32,
    pub entries: Vec<LeaderboardEntry>,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeEarned {
    pub participant_id: String,
    pub badge_name: String,
    #[serde(default)]
    pub badge_icon: Option<String>,
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    StepUpdate(StepUpdate),
    TotalUpdate(TotalUpdate),
    LeaderboardUpdate(LeaderboardUpdate),
    BadgeEarned(BadgeEarned),
    Ping {
        #[serde(default)]
        timestamp: Option<WireTimestamp>,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<WireTimestamp>,
    },
    Welcome {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        timestamp: Option<WireTimestamp>,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "step_update",
    "total_update",
    "leaderboard_update",
    "badge_earned",
    "ping",
    "pong",
    "welcome",
];

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::StepUpdate(_) => "step_update",
            ServerMessage::TotalUpdate(_) => "total_update",
            ServerMessage::LeaderboardUpdate(_) => "leaderboard_update",
            ServerMessage::BadgeEarned(_) => "badge_earned",
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Welcome { .. } => "welcome",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("frame is not JSON: {0}")]
    InvalidJson(String),

    #[error("frame has no string 'type' field")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("malformed '{kind}' message: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Parses a text frame. Unknown types are reported separately from malformed
/// known ones so callers can log them at different levels.
pub fn parse_server_message(raw: &str) -> Result<ServerMessage, WireError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| WireError::InvalidJson(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(WireError::MissingType)?
        .to_string();

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(WireError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| WireError::Malformed {
        kind,
        reason: e.to_string(),
    })
}
