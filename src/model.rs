use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// --- Typed IDs ---

/// Stable identity of a queued delta, generated at creation time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(String);

impl ConflictId {
    pub fn at(now: UnixTimeMs) -> Self {
        Self(format!("conflict_{}", now.0))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub(crate) fn with_suffix(&self, n: u32) -> Self {
        Self(format!("{}_{}", self.0, n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Priority ---

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid priority value: {0} (expected 0..=3)")]
pub struct InvalidPriority(pub u8);

/// Queue position and eviction order. Higher values sync first and are evicted last.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidPriority;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Critical),
            other => Err(InvalidPriority(other)),
        }
    }
}

// --- Queue items ---

/// Provenance tags. Informational only, never used for ordering or eviction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ItemMetadata {
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }
}

/// One pending step delta.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    // Older persisted layouts carry no id; those items get a fresh one on load.
    #[serde(default = "ItemId::generate")]
    pub id: ItemId,
    pub delta: i64,
    pub timestamp: UnixTimeMs,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt: Option<UnixTimeMs>,
    #[serde(default)]
    pub metadata: ItemMetadata,
}

impl QueueItem {
    pub fn new(delta: i64, priority: Priority, metadata: ItemMetadata, now: UnixTimeMs) -> Self {
        Self {
            id: ItemId::generate(),
            delta,
            timestamp: now,
            synced: false,
            priority,
            attempts: 0,
            last_attempt: None,
            metadata,
        }
    }

    pub fn record_attempt(&mut self, now: UnixTimeMs) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(now);
    }

    pub fn has_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}

/// Sort by priority (desc) then timestamp (asc). `sort_by` is stable, so equal
/// keys keep insertion order.
pub fn sort_queue(items: &mut [QueueItem]) {
    items.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
}

// --- Conflicts ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    AcceptServer,
    AcceptLocal,
    Manual,
}

/// A discrepancy between the expected and the actual post-sync server total.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: ConflictId,
    pub timestamp: UnixTimeMs,
    pub local_delta: i64,
    pub server_total: i64,
    pub expected_total: i64,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
}

impl SyncConflict {
    pub fn new(
        id: ConflictId,
        local_delta: i64,
        server_total: i64,
        expected_total: i64,
        now: UnixTimeMs,
    ) -> Self {
        Self {
            id,
            timestamp: now,
            local_delta,
            server_total,
            expected_total,
            resolved: false,
            resolution: None,
        }
    }

    /// Server total minus expected total.
    pub fn discrepancy(&self) -> i64 {
        self.server_total.saturating_sub(self.expected_total)
    }

    pub fn resolve(&mut self, resolution: ConflictResolution) {
        self.resolved = true;
        self.resolution = Some(resolution);
    }
}

/// Diagnostic snapshot of the queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub synced: usize,
    pub unsynced: usize,
    pub total_delta: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "2");
        let p: Priority = serde_json::from_str("3").unwrap();
        assert_eq!(p, Priority::Critical);
        assert!(serde_json::from_str::<Priority>("7").is_err());
    }

    #[test]
    fn priority_ordering_matches_numeric_value() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn queue_item_uses_camel_case_layout() {
        let item = QueueItem::new(
            42,
            Priority::Normal,
            ItemMetadata::from_source("pedometer"),
            UnixTimeMs(1_000),
        );
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["delta"], 42);
        assert_eq!(json["lastAttempt"], serde_json::Value::Null);
        assert_eq!(json["metadata"]["source"], "pedometer");
        assert!(json["metadata"].get("userId").is_none());
    }

    #[test]
    fn legacy_item_without_id_gets_one() {
        let json = r#"{"delta":10,"timestamp":5,"synced":false,"priority":1,"attempts":0,"lastAttempt":null,"metadata":{}}"#;
        let a: QueueItem = serde_json::from_str(json).unwrap();
        let b: QueueItem = serde_json::from_str(json).unwrap();
        assert!(!a.id.as_str().is_empty());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn sort_is_priority_desc_then_timestamp_asc() {
        let meta = ItemMetadata::default();
        let mut items = vec![
            QueueItem::new(1, Priority::Low, meta.clone(), UnixTimeMs(1)),
            QueueItem::new(2, Priority::High, meta.clone(), UnixTimeMs(3)),
            QueueItem::new(3, Priority::High, meta.clone(), UnixTimeMs(2)),
            QueueItem::new(4, Priority::Normal, meta, UnixTimeMs(0)),
        ];
        sort_queue(&mut items);
        let deltas: Vec<i64> = items.iter().map(|i| i.delta).collect();
        assert_eq!(deltas, vec![3, 2, 4, 1]);
    }

    #[test]
    fn conflict_id_format() {
        assert_eq!(ConflictId::at(UnixTimeMs(1700)).as_str(), "conflict_1700");
        assert_eq!(
            ConflictId::at(UnixTimeMs(1700)).with_suffix(2).as_str(),
            "conflict_1700_2"
        );
    }

    #[test]
    fn conflict_resolution_round_trip_names() {
        assert_eq!(
            serde_json::to_string(&ConflictResolution::AcceptServer).unwrap(),
            "\"accept_server\""
        );
        let mut c = SyncConflict::new(ConflictId::new("c"), 50, 1150, 1100, UnixTimeMs(0));
        assert_eq!(c.discrepancy(), 50);
        c.resolve(ConflictResolution::Manual);
        assert!(c.resolved);
        assert_eq!(c.resolution, Some(ConflictResolution::Manual));
    }
}
