//! Relying-party side: talking to the upstream identity provider.

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

/// Tokens returned by the upstream token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub id_token: Option<String>,
}

/// The upstream user, as reported by its userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProfile {
    pub external_id: String,
    pub email: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait UpstreamIdentityBroker: Send + Sync {
    /// Authorization endpoint URL carrying our request id as `state`.
    fn authorization_url(&self, state: &str, redirect_uri: &str) -> Url;

    /// Exchange an upstream authorization code for upstream tokens.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<UpstreamTokens>;

    /// Fetch the profile belonging to an upstream access token.
    async fn fetch_profile(&self, access_token: &str) -> Result<UpstreamProfile>;
}

#[derive(Deserialize)]
struct UserInfoResponse {
    sub: Option<String>,
    email: Option<String>,
    name: Option<String>,
}

/// [`UpstreamIdentityBroker`] over HTTP with a confidential client registration.
pub struct HttpUpstream {
    config: UpstreamConfig,
    http_client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
        })
    }
}

#[async_trait]
impl UpstreamIdentityBroker for HttpUpstream {
    fn authorization_url(&self, state: &str, redirect_uri: &str) -> Url {
        let mut url = self.config.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");
        url
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<UpstreamTokens> {
        tracing::debug!("exchanging upstream code at {}", self.config.token_url);

        let response = self
            .http_client
            .post(self.config.token_url.as_str())
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("upstream token exchange failed: {} {}", status, body);
            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let tokens: UpstreamTokens = response.json().await.map_err(|e| {
            tracing::error!("failed to parse upstream token response: {}", e);
            Error::Network(format!("invalid token response: {}", e))
        })?;

        Ok(tokens)
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<UpstreamProfile> {
        let response = self
            .http_client
            .get(self.config.userinfo_url.as_str())
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("upstream userinfo request failed: {} {}", status, body);
            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let info: UserInfoResponse = response.json().await.map_err(|e| {
            tracing::error!("failed to parse upstream userinfo: {}", e);
            Error::Network(format!("invalid userinfo response: {}", e))
        })?;

        match (info.sub, info.email) {
            (Some(external_id), Some(email)) if !external_id.is_empty() && !email.is_empty() => {
                Ok(UpstreamProfile {
                    external_id,
                    email,
                    name: info.name,
                })
            }
            _ => Err(Error::Upstream {
                status: 200,
                body: "userinfo response lacks sub or email".to_string(),
            }),
        }
    }
}
