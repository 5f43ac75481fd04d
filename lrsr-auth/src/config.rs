use crate::error::{Error, Result};
use std::time::Duration;
use url::Url;

const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// Thirty days; the bearer token and the session cookie share this lifetime.
const DEFAULT_ACCESS_TOKEN_TTL_SECS: i64 = 30 * 24 * 3600;

/// Upper bound for the bearer token lifetime.
pub const MAX_ACCESS_TOKEN_TTL_SECS: i64 = 365 * 24 * 3600;

/// Configuration for the authorization broker.
///
/// Built once at startup, either through [`BrokerConfig::new`] and the
/// `with_*` setters or from the process environment via
/// [`BrokerConfig::from_env`]. Missing required values fail construction.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Public address of this broker; also the `iss` claim
    pub issuer: Url,

    /// `aud` claim of issued tokens
    pub audience: String,

    /// ES256 key material used for issuing and verifying tokens
    pub keys: SigningKeyConfig,

    /// Downstream clients allowed to start a flow, as `id` or `id=Display Name`
    pub allowed_clients: Vec<String>,

    /// Non-loopback redirect URIs accepted from clients, matched exactly.
    /// Loopback `http` redirects are always accepted.
    pub allowed_redirect_uris: Vec<String>,

    /// Application home page; the approval UI lives at `{app_url}/oauth/approve`
    pub app_url: Url,

    /// Upstream identity provider settings
    pub upstream: UpstreamConfig,

    /// Name of the browser session cookie
    pub session_cookie_name: String,

    /// Lifetime of issued bearer tokens and the session cookie
    pub access_token_ttl_seconds: i64,

    /// Lifetime of pending authorization requests
    pub request_ttl: Duration,

    /// Lifetime of issued authorization codes
    pub code_ttl: Duration,

    /// Lifetime of stored upstream refresh tokens
    pub refresh_token_ttl: Duration,
}

/// Externally provisioned ES256 key pair.
#[derive(Clone)]
pub struct SigningKeyConfig {
    /// `kid` published in the JWKS and stamped into token headers
    pub key_id: String,
    /// PKCS#8 PEM encoded P-256 private key
    pub private_key_pem: String,
    /// SPKI PEM encoded P-256 public key
    pub public_key_pem: String,
}

impl std::fmt::Debug for SigningKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyConfig")
            .field("key_id", &self.key_id)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Confidential client registration at the upstream identity provider.
#[derive(Clone)]
pub struct UpstreamConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: Url,
    pub token_url: Url,
    pub userinfo_url: Url,
    pub scopes: Vec<String>,
    /// Upper bound for every upstream HTTP call
    pub request_timeout: Duration,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("authorize_url", &self.authorize_url.as_str())
            .field("token_url", &self.token_url.as_str())
            .field("userinfo_url", &self.userinfo_url.as_str())
            .field("scopes", &self.scopes)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl UpstreamConfig {
    /// Google endpoints with the given client credentials.
    pub fn google(client_id: impl Into<String>, client_secret: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authorize_url: parse_url("upstream authorize url", GOOGLE_AUTHORIZE_URL)?,
            token_url: parse_url("upstream token url", GOOGLE_TOKEN_URL)?,
            userinfo_url: parse_url("upstream userinfo url", GOOGLE_USERINFO_URL)?,
            scopes: vec!["openid".into(), "email".into(), "profile".into()],
            request_timeout: Duration::from_secs(10),
        })
    }
}

impl BrokerConfig {
    /// Create a new configuration with defaults for everything optional.
    pub fn new(
        issuer: Url,
        audience: impl Into<String>,
        keys: SigningKeyConfig,
        upstream: UpstreamConfig,
    ) -> Self {
        Self {
            app_url: issuer.clone(),
            issuer,
            audience: audience.into(),
            keys,
            allowed_clients: Vec::new(),
            allowed_redirect_uris: Vec::new(),
            upstream,
            session_cookie_name: "lrsr_session".to_string(),
            access_token_ttl_seconds: DEFAULT_ACCESS_TOKEN_TTL_SECS,
            request_ttl: Duration::from_secs(5 * 60),
            code_ttl: Duration::from_secs(5 * 60),
            refresh_token_ttl: Duration::from_secs(90 * 24 * 3600),
        }
    }

    /// Set the downstream client allow-list
    pub fn with_allowed_clients<I, S>(mut self, clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_clients = clients.into_iter().map(Into::into).collect();
        self
    }

    /// Set the exact-match redirect URIs allowed besides loopback ones
    pub fn with_allowed_redirect_uris<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_redirect_uris = uris.into_iter().map(Into::into).collect();
        self
    }

    /// Set the application home page
    pub fn with_app_url(mut self, url: Url) -> Self {
        self.app_url = url;
        self
    }

    /// Set the session cookie name
    pub fn with_session_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.session_cookie_name = name.into();
        self
    }

    /// Set the bearer token lifetime in seconds
    pub fn with_access_token_ttl(mut self, seconds: i64) -> Self {
        self.access_token_ttl_seconds = seconds;
        self
    }

    /// Read the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| var(key).ok_or_else(|| Error::Config(format!("{key} is not set")));
        // PEM values may be given inline or as a path in `{key}_FILE`
        let pem = |key: &str| -> Result<String> {
            if let Some(value) = var(key) {
                return Ok(value.replace("\\n", "\n"));
            }
            let file_key = format!("{key}_FILE");
            let path = var(&file_key)
                .ok_or_else(|| Error::Config(format!("{key} or {file_key} must be set")))?;
            std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("failed to read {path}: {e}")))
        };

        let issuer = parse_url("LRSR_ISSUER", &required("LRSR_ISSUER")?)?;
        let keys = SigningKeyConfig {
            key_id: required("LRSR_KEY_ID")?,
            private_key_pem: pem("LRSR_SIGNING_KEY")?,
            public_key_pem: pem("LRSR_VERIFYING_KEY")?,
        };

        let mut upstream = UpstreamConfig::google(
            required("LRSR_UPSTREAM_CLIENT_ID")?,
            required("LRSR_UPSTREAM_CLIENT_SECRET")?,
        )?;
        if let Some(url) = var("LRSR_UPSTREAM_AUTHORIZE_URL") {
            upstream.authorize_url = parse_url("LRSR_UPSTREAM_AUTHORIZE_URL", &url)?;
        }
        if let Some(url) = var("LRSR_UPSTREAM_TOKEN_URL") {
            upstream.token_url = parse_url("LRSR_UPSTREAM_TOKEN_URL", &url)?;
        }
        if let Some(url) = var("LRSR_UPSTREAM_USERINFO_URL") {
            upstream.userinfo_url = parse_url("LRSR_UPSTREAM_USERINFO_URL", &url)?;
        }
        if let Some(secs) = var("LRSR_UPSTREAM_TIMEOUT_SECS") {
            upstream.request_timeout =
                Duration::from_secs(parse_number("LRSR_UPSTREAM_TIMEOUT_SECS", &secs)?);
        }

        let mut config = Self::new(issuer, required("LRSR_AUDIENCE")?, keys, upstream);

        if let Some(clients) = var("LRSR_ALLOWED_CLIENTS") {
            config = config.with_allowed_clients(
                clients
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from),
            );
        }
        if let Some(uris) = var("LRSR_ALLOWED_REDIRECT_URIS") {
            config = config.with_allowed_redirect_uris(
                uris.split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(String::from),
            );
        }
        if let Some(url) = var("LRSR_APP_URL") {
            config = config.with_app_url(parse_url("LRSR_APP_URL", &url)?);
        }
        if let Some(name) = var("LRSR_SESSION_COOKIE") {
            config = config.with_session_cookie_name(name);
        }
        if let Some(ttl) = var("LRSR_TOKEN_TTL_SECS") {
            let ttl = parse_number("LRSR_TOKEN_TTL_SECS", &ttl)?;
            let ttl = i64::try_from(ttl)
                .ok()
                .filter(|ttl| (1..=MAX_ACCESS_TOKEN_TTL_SECS).contains(ttl))
                .ok_or_else(|| {
                    Error::Config(format!(
                        "LRSR_TOKEN_TTL_SECS must be between 1 and {MAX_ACCESS_TOKEN_TTL_SECS}"
                    ))
                })?;
            config = config.with_access_token_ttl(ttl);
        }

        Ok(config)
    }

    /// Issuer as used in the `iss` claim, without a trailing slash.
    pub fn issuer_str(&self) -> &str {
        self.issuer.as_str().trim_end_matches('/')
    }

    /// Absolute URL of one of the broker's own endpoints.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.issuer_str(), path)
    }

    /// Where the upstream provider sends the browser back to.
    pub fn callback_url(&self) -> String {
        self.endpoint("/callback")
    }

    /// Local approval page; the request id is appended as `?request=`.
    pub fn approval_url(&self) -> String {
        format!("{}/oauth/approve", self.app_url.as_str().trim_end_matches('/'))
    }

    pub fn home_url(&self) -> String {
        self.app_url.to_string()
    }
}

fn parse_url(name: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| Error::Config(format!("{name} is not a valid url: {e}")))
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name} is not a number: {e}")))
}
