//! PKCE (RFC 7636) challenge computation and verification.

use crate::error::Error;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Code challenge method, fixed when the challenge is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl CodeChallengeMethod {
    pub fn parse(method: &str) -> Result<Self, Error> {
        match method {
            "S256" => Ok(Self::S256),
            "plain" => Ok(Self::Plain),
            other => Err(Error::InvalidRequest(format!(
                "unsupported code_challenge_method: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S256 => "S256",
            Self::Plain => "plain",
        }
    }
}

impl std::fmt::Display for CodeChallengeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hashing primitive behind `S256` challenges.
pub trait ChallengeHasher: Send + Sync {
    /// `BASE64URL-NOPAD(SHA256(bytes))`
    fn sha256_base64url(&self, bytes: &[u8]) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ChallengeHasher for Sha256Hasher {
    fn sha256_base64url(&self, bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

#[derive(Clone)]
pub struct PkceVerifier {
    hasher: Arc<dyn ChallengeHasher>,
}

impl Default for PkceVerifier {
    fn default() -> Self {
        Self::new(Arc::new(Sha256Hasher))
    }
}

impl PkceVerifier {
    pub fn new(hasher: Arc<dyn ChallengeHasher>) -> Self {
        Self { hasher }
    }

    pub fn challenge_from(&self, verifier: &str, method: CodeChallengeMethod) -> String {
        match method {
            CodeChallengeMethod::S256 => self.hasher.sha256_base64url(verifier.as_bytes()),
            CodeChallengeMethod::Plain => verifier.to_string(),
        }
    }

    /// Check `verifier` against a challenge stored at code issuance.
    pub fn matches(
        &self,
        stored_challenge: &str,
        verifier: &str,
        method: CodeChallengeMethod,
    ) -> bool {
        use subtle::ConstantTimeEq;

        let computed = self.challenge_from(verifier, method);
        computed
            .as_bytes()
            .ct_eq(stored_challenge.as_bytes())
            .into()
    }
}
