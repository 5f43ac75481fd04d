use crate::error::Result;
use crate::pkce::CodeChallengeMethod;
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;

/// Key-value storage with a per-key TTL.
///
/// Implementations own expiry: an expired key must read as absent.
/// `consume` must be atomic, so that of several concurrent callers for the
/// same key exactly one observes the value.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Read a value without removing it
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read and remove a value in one step
    async fn consume(&self, key: &str) -> Result<Option<String>>;
}

/// Namespace of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    AuthorizationRequest,
    AuthorizationCode,
    RefreshToken,
}

impl RecordKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RecordKind::AuthorizationRequest => "auth_request",
            RecordKind::AuthorizationCode => "auth_code",
            RecordKind::RefreshToken => "refresh_token",
        }
    }

    pub fn key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix(), id)
    }
}

/// A record type that lives in the ephemeral store.
pub trait StateRecord: Serialize + DeserializeOwned + Send + Sync {
    const KIND: RecordKind;
}

/// A downstream authorization request awaiting identity and consent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    /// Absent for a plain login that is not an OAuth delegation
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    /// The downstream client's own `state`, echoed back verbatim
    pub state: Option<String>,
    pub scope: Option<String>,
    /// Set once the browser has proven who it is
    pub user_id: Option<i64>,
}

impl StateRecord for AuthorizationRequest {
    const KIND: RecordKind = RecordKind::AuthorizationRequest;
}

/// A one-time authorization code issued after consent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub user_id: i64,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub scope: Option<String>,
}

impl StateRecord for AuthorizationCode {
    const KIND: RecordKind = RecordKind::AuthorizationCode;
}

/// Owner of an upstream refresh token; keyed by the token itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub user_id: i64,
}

impl StateRecord for RefreshTokenRecord {
    const KIND: RecordKind = RecordKind::RefreshToken;
}

/// Typed view over a [`StateStore`].
#[derive(Clone)]
pub struct EphemeralStateStore {
    inner: Arc<dyn StateStore>,
}

impl EphemeralStateStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self { inner }
    }

    pub async fn put<R: StateRecord>(&self, id: &str, record: &R, ttl: Duration) -> Result<()> {
        let value = serde_json::to_string(record)?;
        self.inner.put(&R::KIND.key(id), value, ttl).await
    }

    pub async fn get<R: StateRecord>(&self, id: &str) -> Result<Option<R>> {
        match self.inner.get(&R::KIND.key(id)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn consume<R: StateRecord>(&self, id: &str) -> Result<Option<R>> {
        match self.inner.consume(&R::KIND.key(id)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }
}
