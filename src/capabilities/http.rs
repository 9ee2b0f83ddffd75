use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::credentials::{CredentialProvider, Credentials};

pub const MAX_URL_LENGTH: usize = 2048;
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const STEPS_PATH: &str = "steps";
const WEBSOCKET_PATH: &str = "ws/steps";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("no auth credentials available")]
    MissingCredentials,

    #[error("authentication rejected (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("connection failed: {message}")]
    Connection { message: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl TransportError {
    /// Maps a non-success status. 401/403 are auth failures; 408, 429 and 5xx
    /// are transient.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => TransportError::Unauthorized { status },
            _ => TransportError::HttpStatus {
                status,
                message: message.into(),
                retryable: status == 408 || status == 429 || (500..600).contains(&status),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout { .. } => true,
            TransportError::Connection { .. } => true,
            TransportError::HttpStatus { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Unauthorized { .. } | TransportError::MissingCredentials
        )
    }
}

fn truncate_url(url: &str) -> String {
    if url.len() <= 100 {
        url.to_string()
    } else {
        let cut = (0..=100).rev().find(|i| url.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &url[..cut])
    }
}

/// Client-generated token that lets the server deduplicate a resent round.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Validated API base URL and the REST and realtime URLs derived from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiEndpoint {
    base: Url,
}

impl ApiEndpoint {
    pub fn new(base: &str) -> Result<Self, TransportError> {
        let invalid = |reason: String| TransportError::InvalidUrl {
            url: truncate_url(base),
            reason,
        };

        if base.trim().is_empty() {
            return Err(invalid("URL cannot be empty".to_string()));
        }
        if base.len() > MAX_URL_LENGTH {
            return Err(invalid(format!(
                "URL exceeds maximum length of {} bytes",
                MAX_URL_LENGTH
            )));
        }

        let parsed = Url::parse(base).map_err(|e| invalid(e.to_string()))?;

        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(invalid(format!(
                "invalid scheme '{}', only 'http' and 'https' are allowed",
                scheme
            )));
        }
        if parsed.host_str().is_none() {
            return Err(invalid("URL must have a host".to_string()));
        }
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(invalid("credentials in URL are not allowed".to_string()));
        }

        Ok(Self { base: parsed })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn with_path(&self, suffix: &str) -> Url {
        let mut url = self.base.clone();
        let path = format!("{}/{}", self.base.path().trim_end_matches('/'), suffix);
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);
        url
    }

    pub fn steps_url(&self) -> Url {
        self.with_path(STEPS_PATH)
    }

    /// `http` becomes `ws`, `https` becomes `wss`. The token travels in the
    /// query, so never log the result; use [`ApiEndpoint::websocket_url_redacted`].
    pub fn websocket_url(&self, credentials: &Credentials) -> Result<Url, TransportError> {
        let mut url = self.websocket_url_redacted()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("user_id", &credentials.user_id);
            query.append_pair("token", credentials.token.expose_secret());
            if let Some(participant_id) = &credentials.participant_id {
                query.append_pair("participant_id", participant_id);
            }
        }
        Ok(url)
    }

    pub fn websocket_url_redacted(&self) -> Result<Url, TransportError> {
        let mut url = self.with_path(WEBSOCKET_PATH);
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidUrl {
                url: truncate_url(self.base.as_str()),
                reason: format!("cannot switch scheme to '{}'", scheme),
            })?;
        Ok(url)
    }
}

// ============================================================================
// Steps API
// ============================================================================

#[derive(Debug, Serialize)]
struct StepsRequestBody {
    steps: i64,
}

#[derive(Debug, Deserialize)]
struct StepsResponseBody {
    total_steps: i64,
}

/// The authoritative server endpoint that applies a delta and reports the new total.
#[async_trait]
pub trait StepsApi: Send + Sync {
    async fn post_steps(&self, delta: i64, key: &IdempotencyKey) -> Result<i64, TransportError>;
}

pub struct ReqwestStepsApi {
    client: reqwest::Client,
    endpoint: ApiEndpoint,
    credentials: Arc<dyn CredentialProvider>,
    timeout: Duration,
}

impl std::fmt::Debug for ReqwestStepsApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestStepsApi")
            .field("endpoint", &self.endpoint.base().as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ReqwestStepsApi {
    pub fn new(
        endpoint: ApiEndpoint,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connection {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint,
            credentials,
            timeout,
        })
    }

    fn map_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if e.is_decode() {
            TransportError::InvalidResponse {
                reason: e.to_string(),
            }
        } else {
            TransportError::Connection {
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl StepsApi for ReqwestStepsApi {
    #[instrument(skip(self, key), fields(idempotency_key = %key))]
    async fn post_steps(&self, delta: i64, key: &IdempotencyKey) -> Result<i64, TransportError> {
        let credentials = self
            .credentials
            .credentials()
            .await
            .ok_or(TransportError::MissingCredentials)?;

        let response = self
            .client
            .post(self.endpoint.steps_url())
            .bearer_auth(credentials.token.expose_secret())
            .header(IDEMPOTENCY_HEADER, key.as_str())
            .json(&StepsRequestBody { steps: delta })
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = TransportError::from_status(status.as_u16(), truncate_url(&body));
            warn!(status = status.as_u16(), error = %err, "steps sync rejected");
            return Err(err);
        }

        let body: StepsResponseBody = response.json().await.map_err(|e| {
            TransportError::InvalidResponse {
                reason: e.to_string(),
            }
        })?;

        debug!(total_steps = body.total_steps, "steps accepted by server");
        Ok(body.total_steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            TransportError::from_status(401, ""),
            TransportError::Unauthorized { status: 401 }
        ));
        assert!(!TransportError::from_status(403, "").is_retryable());
        assert!(TransportError::from_status(403, "").is_auth_failure());

        for status in [408, 429, 500, 502, 503, 504] {
            assert!(TransportError::from_status(status, "x").is_retryable(), "{status}");
        }
        for status in [400, 404, 409, 422] {
            assert!(!TransportError::from_status(status, "x").is_retryable(), "{status}");
        }

        assert!(TransportError::Timeout { timeout_ms: 1 }.is_retryable());
        assert!(TransportError::Connection { message: "reset".into() }.is_retryable());
        assert!(!TransportError::MissingCredentials.is_retryable());
        assert!(!TransportError::InvalidResponse { reason: "x".into() }.is_retryable());
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(ApiEndpoint::new("https://api.example.org").is_ok());
        assert!(ApiEndpoint::new("").is_err());
        assert!(ApiEndpoint::new("ftp://api.example.org").is_err());
        assert!(ApiEndpoint::new("https://user:pw@api.example.org").is_err());
        assert!(ApiEndpoint::new("not a url").is_err());
        let long = format!("https://example.org/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(ApiEndpoint::new(&long).is_err());
    }

    #[test]
    fn test_steps_url() {
        let endpoint = ApiEndpoint::new("https://api.example.org/v1/").unwrap();
        assert_eq!(endpoint.steps_url().as_str(), "https://api.example.org/v1/steps");

        let endpoint = ApiEndpoint::new("http://api.example.org").unwrap();
        assert_eq!(endpoint.steps_url().as_str(), "http://api.example.org/steps");
    }

    #[test]
    fn test_websocket_url_translation() {
        let creds = Credentials::new("t0k", "user-1");

        let secure = ApiEndpoint::new("https://api.example.org").unwrap();
        let url = secure.websocket_url(&creds).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/ws/steps");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("user_id".to_string(), "user-1".to_string()),
                ("token".to_string(), "t0k".to_string()),
            ]
        );

        let plain = ApiEndpoint::new("http://api.example.org:8080").unwrap();
        let url = plain
            .websocket_url(&creds.clone().with_participant("p-7"))
            .unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(8080));
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "participant_id" && v == "p-7"));
    }

    #[test]
    fn test_redacted_websocket_url_has_no_query() {
        let endpoint = ApiEndpoint::new("https://api.example.org").unwrap();
        let url = endpoint.websocket_url_redacted().unwrap();
        assert_eq!(url.as_str(), "wss://api.example.org/ws/steps");
    }

    #[test]
    fn test_idempotency_keys_are_unique() {
        assert_ne!(IdempotencyKey::generate(), IdempotencyKey::generate());
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_before_network() {
        use crate::capabilities::credentials::StaticCredentials;

        let api = ReqwestStepsApi::new(
            ApiEndpoint::new("https://api.example.org").unwrap(),
            Arc::new(StaticCredentials::none()),
            Duration::from_secs(1),
        )
        .unwrap();
        let err = api
            .post_steps(10, &IdempotencyKey::generate())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::MissingCredentials);
    }
}
