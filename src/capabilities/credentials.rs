use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::kv::{self, KeyValueStore};

pub const AUTH_TOKEN_KEY: &str = "auth_token";
pub const USER_ID_KEY: &str = "user_id";
pub const PARTICIPANT_ID_KEY: &str = "participant_id";
pub const USER_PERMISSIONS_KEY: &str = "user_permissions";

/// Auth material consumed by the REST and realtime transports.
pub struct Credentials {
    pub token: SecretString,
    pub user_id: String,
    pub participant_id: Option<String>,
}

impl Credentials {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: SecretString::new(token.into()),
            user_id: user_id.into(),
            participant_id: None,
        }
    }

    pub fn with_participant(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = Some(participant_id.into());
        self
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            token: SecretString::new(self.token.expose_secret().clone()),
            user_id: self.user_id.clone(),
            participant_id: self.participant_id.clone(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("participant_id", &self.participant_id)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
}

/// Cached permission grants, read but never modelled here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSnapshot(pub Vec<Permission>);

impl PermissionSnapshot {
    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.0
            .iter()
            .any(|p| p.resource == resource && p.action == action)
    }

    pub fn can_read_steps(&self) -> bool {
        self.allows("steps", "read")
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self) -> Option<Credentials>;

    /// `None` means no snapshot is cached, which does not block connecting.
    async fn permissions(&self) -> Option<PermissionSnapshot>;
}

/// Reads credentials the host's auth flow stored in the key-value store.
pub struct KvCredentialProvider {
    kv: Arc<dyn KeyValueStore>,
}

impl KvCredentialProvider {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.kv.get(key).await {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                warn!(key, error = %e, "failed to read credential key");
                None
            }
        }
    }
}

#[async_trait]
impl CredentialProvider for KvCredentialProvider {
    async fn credentials(&self) -> Option<Credentials> {
        let token = self.read(AUTH_TOKEN_KEY).await?;
        let user_id = self.read(USER_ID_KEY).await?;
        let participant_id = self.read(PARTICIPANT_ID_KEY).await;

        Some(Credentials {
            token: SecretString::new(token),
            user_id,
            participant_id,
        })
    }

    async fn permissions(&self) -> Option<PermissionSnapshot> {
        match kv::get_json::<PermissionSnapshot>(self.kv.as_ref(), USER_PERMISSIONS_KEY).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable permission snapshot");
                None
            }
        }
    }
}

/// Fixed credentials, for hosts that manage tokens themselves and for tests.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    credentials: Option<Credentials>,
    permissions: Option<PermissionSnapshot>,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
            permissions: None,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_permissions(mut self, permissions: PermissionSnapshot) -> Self {
        self.permissions = Some(permissions);
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    async fn permissions(&self) -> Option<PermissionSnapshot> {
        self.permissions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::MemoryKv;

    #[tokio::test]
    async fn test_kv_provider_requires_token_and_user() {
        let kv = Arc::new(MemoryKv::new());
        let provider = KvCredentialProvider::new(kv.clone());
        assert!(provider.credentials().await.is_none());

        kv.set(AUTH_TOKEN_KEY, "tok").await.unwrap();
        assert!(provider.credentials().await.is_none());

        kv.set(USER_ID_KEY, "u1").await.unwrap();
        let creds = provider.credentials().await.unwrap();
        assert_eq!(creds.token.expose_secret(), "tok");
        assert_eq!(creds.user_id, "u1");
        assert_eq!(creds.participant_id, None);

        kv.set(PARTICIPANT_ID_KEY, "p9").await.unwrap();
        let creds = provider.credentials().await.unwrap();
        assert_eq!(creds.participant_id.as_deref(), Some("p9"));
    }

    #[tokio::test]
    async fn test_permission_snapshot() {
        let kv = Arc::new(MemoryKv::new());
        let provider = KvCredentialProvider::new(kv.clone());
        assert!(provider.permissions().await.is_none());

        kv.set(
            USER_PERMISSIONS_KEY,
            r#"[{"resource":"steps","action":"write"},{"resource":"steps","action":"read"}]"#,
        )
        .await
        .unwrap();
        assert!(provider.permissions().await.unwrap().can_read_steps());

        kv.set(USER_PERMISSIONS_KEY, r#"[{"resource":"teams","action":"read"}]"#)
            .await
            .unwrap();
        assert!(!provider.permissions().await.unwrap().can_read_steps());

        kv.set(USER_PERMISSIONS_KEY, "garbage").await.unwrap();
        assert!(provider.permissions().await.is_none());
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds = Credentials::new("super-secret", "u1");
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("REDACTED"));
    }
}
