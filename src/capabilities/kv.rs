use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("serialization error for '{key}': {message}")]
    Serialization { key: String, message: String },

    #[error("storage error: {message}")]
    Storage { message: String },
}

impl KvError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

pub fn validate_key(key: &str) -> Result<(), KvError> {
    if key.trim().is_empty() {
        return Err(KvError::InvalidKey {
            key: key.to_string(),
            reason: "key cannot be empty".to_string(),
        });
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(KvError::InvalidKey {
            key: key.chars().take(50).collect::<String>() + "...",
            reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
        });
    }

    if key.chars().any(|c| c == '\0' || (c.is_control() && c != '\t')) {
        return Err(KvError::InvalidKey {
            key: key.replace('\0', "\\0"),
            reason: "key contains invalid control characters".to_string(),
        });
    }

    Ok(())
}

fn validate_value(value: &str) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Durable string key-value storage provided by the host platform.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    async fn remove(&self, key: &str) -> Result<(), KvError>;
}

/// Reads a JSON value. A missing key is `Ok(None)`.
pub async fn get_json<T: DeserializeOwned>(
    kv: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, KvError> {
    match kv.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| KvError::Serialization {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + ?Sized>(
    kv: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), KvError> {
    let raw = serde_json::to_string(value).map_err(|e| KvError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    kv.set(key, &raw).await
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        validate_key(key)?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        validate_key(key)?;
        validate_value(value)?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        validate_key(key)?;
        self.entries.write().await.remove(key);
        Ok(())
    }
}

// ============================================================================
// SQLite store
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKv;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// SQLite-backed store. Statements run on the blocking pool.
    #[derive(Clone)]
    pub struct SqliteKv {
        conn: Arc<Mutex<Connection>>,
    }

    impl std::fmt::Debug for SqliteKv {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SqliteKv").finish_non_exhaustive()
        }
    }

    impl SqliteKv {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(|e| KvError::storage(e.to_string()))?;
            Self::with_connection(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(|e| KvError::storage(e.to_string()))?;
            Self::with_connection(conn)
        }

        fn with_connection(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv_store (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(|e| KvError::storage(e.to_string()))?;

            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn run<T, F>(&self, op: F) -> Result<T, KvError>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let guard = conn
                    .lock()
                    .map_err(|_| KvError::storage("sqlite connection lock poisoned"))?;
                op(&guard).map_err(|e| KvError::storage(e.to_string()))
            })
            .await
            .map_err(|e| KvError::storage(format!("blocking task failed: {}", e)))?
        }
    }

    #[async_trait]
    impl KeyValueStore for SqliteKv {
        async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
            validate_key(key)?;
            let key = key.to_string();
            self.run(move |conn| {
                conn.query_row(
                    "SELECT value FROM kv_store WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
            validate_key(key)?;
            validate_value(value)?;
            let key = key.to_string();
            let value = value.to_string();
            let now = crate::model::UnixTimeMs::now().0 as i64;
            self.run(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO kv_store (key, value, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                    params![key, value, now],
                )
                .map(|_| ())
            })
            .await
        }

        async fn remove(&self, key: &str) -> Result<(), KvError> {
            validate_key(key)?;
            let key = key.to_string();
            self.run(move |conn| {
                conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])
                    .map(|_| ())
            })
            .await
        }
    }
}
