//! The authorization protocol state machine.
//!
//! A flow moves through these stages, each tied to the lifecycle of a stored
//! [`AuthorizationRequest`] or [`AuthorizationCode`]:
//!
//! ```text
//! ANONYMOUS --authorize--> AWAITING_UPSTREAM --callback--> AWAITING_CONSENT
//! ANONYMOUS --authorize (with session)-------------------> AWAITING_CONSENT
//! AWAITING_CONSENT --decision(approve)--> CODE_ISSUED --token--> exchanged
//! AWAITING_CONSENT --decision(deny)-----> denied
//! ```
//!
//! Every time a request gets bound to a user it is stored under a fresh id,
//! so an id seen before authentication can never reach the approval step.

use crate::client::ClientRegistry;
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::pkce::{CodeChallengeMethod, PkceVerifier};
use crate::store::{
    AuthorizationCode, AuthorizationRequest, EphemeralStateStore, RefreshTokenRecord, StateStore,
};
use crate::token::{LocalPrincipal, TokenService};
use crate::upstream::UpstreamIdentityBroker;
use crate::users::{LocalUser, UserLookup, resolve_or_create};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

/// Scopes this broker understands; anything else is dropped from requests.
pub const SUPPORTED_SCOPES: &[&str] = &["openid", "profile", "email", "offline_access"];
const DEFAULT_SCOPE: &str = "openid profile email";

/// Query parameters of `GET /authorize`.
#[derive(Debug, Default, Deserialize)]
pub struct AuthorizeParams {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub state: Option<String>,
    pub scope: Option<String>,
}

/// Query parameters the upstream provider sends to `GET /callback`.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Body of `POST /token`.
#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub code_verifier: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub scope: String,
    pub user: LocalUser,
}

/// What the approval page may show about a pending request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequestView {
    pub request_id: String,
    pub client_id: String,
    pub client_name: String,
    pub scopes: Vec<String>,
}

/// Where to send the browser after the upstream callback.
#[derive(Debug)]
pub struct CallbackOutcome {
    pub location: String,
    /// Session token to set as the browser cookie, on success only
    pub session_token: Option<String>,
}

/// Composes the broker's components into the authorization flow.
#[derive(Clone)]
pub struct AuthorizationOrchestrator {
    config: Arc<BrokerConfig>,
    clients: Arc<ClientRegistry>,
    store: EphemeralStateStore,
    tokens: Arc<TokenService>,
    upstream: Arc<dyn UpstreamIdentityBroker>,
    users: Arc<dyn UserLookup>,
    pkce: PkceVerifier,
}

impl AuthorizationOrchestrator {
    pub fn new(
        config: BrokerConfig,
        state_store: Arc<dyn StateStore>,
        tokens: Arc<TokenService>,
        upstream: Arc<dyn UpstreamIdentityBroker>,
        users: Arc<dyn UserLookup>,
    ) -> Self {
        let clients = ClientRegistry::from_entries(&config.allowed_clients)
            .with_redirect_uris(&config.allowed_redirect_uris);
        if config.allowed_clients.is_empty() {
            tracing::warn!("no downstream clients are configured; every authorize request will be refused");
        }

        Self {
            config: Arc::new(config),
            clients: Arc::new(clients),
            store: EphemeralStateStore::new(state_store),
            tokens,
            upstream,
            users,
            pkce: PkceVerifier::default(),
        }
    }

    pub fn with_pkce_verifier(mut self, pkce: PkceVerifier) -> Self {
        self.pkce = pkce;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Principal behind a session or bearer token, if the token is valid.
    pub fn authenticate(&self, token: Option<&str>) -> Option<LocalPrincipal> {
        token.and_then(|t| self.tokens.verify_token(t))
    }

    /// Validate a downstream authorization request and decide where the
    /// browser goes next: upstream login, or straight to consent.
    pub async fn authorize(
        &self,
        params: AuthorizeParams,
        session: Option<LocalPrincipal>,
    ) -> Result<String> {
        if params.response_type.as_deref() != Some("code") {
            return Err(Error::InvalidRequest(
                "response_type must be code".to_string(),
            ));
        }
        let client_id = non_empty(params.client_id)
            .ok_or_else(|| Error::InvalidRequest("missing client_id".to_string()))?;
        let redirect_uri = non_empty(params.redirect_uri)
            .ok_or_else(|| Error::InvalidRequest("missing redirect_uri".to_string()))?;

        if !self.clients.is_allowed(&client_id) {
            tracing::warn!("authorize refused for unknown client {}", client_id);
            return Err(Error::UnauthorizedClient);
        }

        let parsed = Url::parse(&redirect_uri)
            .map_err(|_| Error::InvalidRequest("redirect_uri must be an absolute URL".to_string()))?;
        if !self.clients.redirect_allowed(&parsed) {
            tracing::warn!("authorize refused redirect_uri {} for {}", redirect_uri, client_id);
            return Err(Error::InvalidRequest("redirect_uri is not permitted".to_string()));
        }

        let code_challenge = non_empty(params.code_challenge);
        let code_challenge_method = match (code_challenge.as_ref(), params.code_challenge_method) {
            (Some(_), Some(method)) => Some(CodeChallengeMethod::parse(&method)?),
            (None, Some(_)) => {
                return Err(Error::InvalidRequest(
                    "code_challenge_method requires code_challenge".to_string(),
                ));
            }
            // RFC 7636 4.3: the method defaults to plain
            (Some(_), None) => Some(CodeChallengeMethod::Plain),
            (None, None) => None,
        };

        let request = AuthorizationRequest {
            client_id: Some(client_id),
            redirect_uri: Some(redirect_uri),
            code_challenge,
            code_challenge_method,
            state: params.state,
            scope: Some(normalize_scope(params.scope.as_deref())),
            user_id: None,
        };

        tracing::info!(
            "authorize request from client {:?}, session present: {}",
            request.client_id,
            session.is_some()
        );

        self.begin(request, session).await
    }

    /// Plain sign-in to the application itself, without a downstream client.
    pub async fn login(&self, session: Option<LocalPrincipal>) -> Result<String> {
        if session.is_some() {
            return Ok(self.config.home_url());
        }

        let request = AuthorizationRequest {
            client_id: None,
            redirect_uri: None,
            code_challenge: None,
            code_challenge_method: None,
            state: None,
            scope: None,
            user_id: None,
        };
        self.begin(request, None).await
    }

    async fn begin(
        &self,
        mut request: AuthorizationRequest,
        session: Option<LocalPrincipal>,
    ) -> Result<String> {
        let request_id = generate_id();

        match session {
            Some(principal) => {
                request.user_id = Some(principal.user_id);
                self.store
                    .put(&request_id, &request, self.config.request_ttl)
                    .await?;
                Ok(self.approval_location(&request_id))
            }
            None => {
                self.store
                    .put(&request_id, &request, self.config.request_ttl)
                    .await?;
                let url = self
                    .upstream
                    .authorization_url(&request_id, &self.config.callback_url());
                Ok(url.to_string())
            }
        }
    }

    /// Handle the upstream provider's redirect back to the broker.
    pub async fn callback(&self, params: CallbackParams) -> Result<CallbackOutcome> {
        let state = non_empty(params.state.clone())
            .ok_or_else(|| Error::InvalidRequest("missing state".to_string()))?;

        let request: AuthorizationRequest = self
            .store
            .consume(&state)
            .await?
            .ok_or_else(|| Error::InvalidRequest("unknown or expired state".to_string()))?;

        match self.finish_callback(&request, params).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!("upstream sign-in failed: {}", e);
                let code = match e {
                    Error::AccessDenied => "access_denied",
                    _ => "server_error",
                };
                Ok(CallbackOutcome {
                    location: self.error_location(&request, code)?,
                    session_token: None,
                })
            }
        }
    }

    async fn finish_callback(
        &self,
        request: &AuthorizationRequest,
        params: CallbackParams,
    ) -> Result<CallbackOutcome> {
        if let Some(error) = params.error {
            tracing::warn!(
                "upstream returned error {}: {}",
                error,
                params.error_description.unwrap_or_default()
            );
            if error == "access_denied" {
                return Err(Error::AccessDenied);
            }
            return Err(Error::Upstream {
                status: 302,
                body: error,
            });
        }
        let code = non_empty(params.code)
            .ok_or_else(|| Error::InvalidRequest("missing code".to_string()))?;

        let upstream_tokens = self
            .upstream
            .exchange_code(&code, &self.config.callback_url())
            .await?;
        let profile = self
            .upstream
            .fetch_profile(&upstream_tokens.access_token)
            .await?;
        let user = resolve_or_create(self.users.as_ref(), &profile).await?;

        let session_token = self.tokens.mint_token(user.id)?;

        if let Some(refresh_token) = upstream_tokens.refresh_token.as_deref() {
            self.store
                .put(
                    refresh_token,
                    &RefreshTokenRecord { user_id: user.id },
                    self.config.refresh_token_ttl,
                )
                .await?;
        }

        let location = if request.client_id.is_none() {
            tracing::info!("user {} signed in", user.id);
            self.config.home_url()
        } else {
            let bound = AuthorizationRequest {
                user_id: Some(user.id),
                ..request.clone()
            };
            let request_id = generate_id();
            self.store
                .put(&request_id, &bound, self.config.request_ttl)
                .await?;
            tracing::info!(
                "user {} authenticated, awaiting consent for client {:?}",
                user.id,
                bound.client_id
            );
            self.approval_location(&request_id)
        };

        Ok(CallbackOutcome {
            location,
            session_token: Some(session_token),
        })
    }

    /// Read a pending request for the approval page.
    pub async fn approval_request(
        &self,
        request_id: Option<&str>,
        session: Option<LocalPrincipal>,
    ) -> Result<ApprovalRequestView> {
        let principal = session.ok_or(Error::Unauthorized)?;
        let request_id = request_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidRequest("missing request".to_string()))?;

        let request: AuthorizationRequest = self
            .store
            .get(request_id)
            .await?
            .ok_or(Error::NotFound)?;

        if request.user_id != Some(principal.user_id) {
            return Err(Error::Forbidden);
        }
        let client_id = request.client_id.ok_or(Error::NotFound)?;

        Ok(ApprovalRequestView {
            request_id: request_id.to_string(),
            client_name: self.clients.display_name(&client_id).to_string(),
            client_id,
            scopes: request
                .scope
                .as_deref()
                .unwrap_or(DEFAULT_SCOPE)
                .split_whitespace()
                .map(String::from)
                .collect(),
        })
    }

    /// Record the user's consent decision; returns the client redirect URL.
    pub async fn decision(
        &self,
        request_id: &str,
        approved: bool,
        session: Option<LocalPrincipal>,
    ) -> Result<String> {
        let principal = session.ok_or(Error::Unauthorized)?;
        if request_id.is_empty() {
            return Err(Error::InvalidRequest("missing requestId".to_string()));
        }

        let request: AuthorizationRequest = self
            .store
            .consume(request_id)
            .await?
            .ok_or(Error::NotFound)?;

        if request.user_id != Some(principal.user_id) {
            tracing::warn!(
                "user {} tried to decide on a request bound to {:?}",
                principal.user_id,
                request.user_id
            );
            return Err(Error::Forbidden);
        }

        let (Some(client_id), Some(redirect_uri)) = (request.client_id, request.redirect_uri) else {
            return Err(Error::InvalidRequest(
                "request has no client to redirect to".to_string(),
            ));
        };

        if !approved {
            tracing::info!("user {} denied client {}", principal.user_id, client_id);
            return with_query(
                &redirect_uri,
                &[("error", Some("access_denied")), ("state", request.state.as_deref())],
            );
        }

        let code = generate_id();
        let record = AuthorizationCode {
            user_id: principal.user_id,
            client_id,
            redirect_uri,
            code_challenge: request.code_challenge,
            code_challenge_method: request.code_challenge_method,
            scope: request.scope,
        };
        self.store.put(&code, &record, self.config.code_ttl).await?;

        tracing::info!(
            "issued authorization code for user {} to client {}",
            record.user_id,
            record.client_id
        );

        with_query(
            &record.redirect_uri,
            &[("code", Some(code.as_str())), ("state", request.state.as_deref())],
        )
    }

    /// Exchange an authorization code for a bearer token.
    pub async fn token(&self, request: TokenRequest) -> Result<TokenResponse> {
        match request.grant_type.as_deref() {
            Some("authorization_code") => {}
            None | Some("") => {
                return Err(Error::InvalidRequest("missing grant_type".to_string()));
            }
            Some(_) => return Err(Error::UnsupportedGrantType),
        }

        let code = non_empty(request.code)
            .ok_or_else(|| Error::InvalidRequest("missing code".to_string()))?;
        let redirect_uri = non_empty(request.redirect_uri)
            .ok_or_else(|| Error::InvalidRequest("missing redirect_uri".to_string()))?;
        let client_id = non_empty(request.client_id)
            .ok_or_else(|| Error::InvalidRequest("missing client_id".to_string()))?;

        if !self.clients.is_allowed(&client_id) {
            return Err(Error::UnauthorizedClient);
        }

        let record: AuthorizationCode = self
            .store
            .consume(&code)
            .await?
            .ok_or_else(|| Error::InvalidGrant("invalid or expired code".to_string()))?;

        if record.client_id != client_id || record.redirect_uri != redirect_uri {
            tracing::warn!(
                "code presented by client {} was issued to client {}",
                client_id,
                record.client_id
            );
            return Err(Error::InvalidGrant(
                "code was not issued to this client and redirect_uri".to_string(),
            ));
        }

        if let Some(challenge) = record.code_challenge.as_deref() {
            let verifier = non_empty(request.code_verifier)
                .ok_or_else(|| Error::InvalidGrant("missing code_verifier".to_string()))?;
            let method = record
                .code_challenge_method
                .unwrap_or(CodeChallengeMethod::Plain);
            if !self.pkce.matches(challenge, &verifier, method) {
                return Err(Error::InvalidGrant("PKCE verification failed".to_string()));
            }
        }

        let user = self
            .users
            .find_by_id(record.user_id)
            .await?
            .ok_or_else(|| Error::InvalidGrant("user no longer exists".to_string()))?;

        let access_token = self.tokens.mint_token(user.id)?;
        tracing::info!("issued access token for user {} to client {}", user.id, client_id);

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.tokens.ttl_seconds(),
            scope: record.scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            user,
        })
    }

    /// Profile of the user behind a bearer token.
    pub async fn userinfo(&self, bearer: Option<&str>) -> Result<LocalUser> {
        let principal = self.authenticate(bearer).ok_or(Error::Unauthorized)?;
        self.users
            .find_by_id(principal.user_id)
            .await?
            .ok_or(Error::Unauthorized)
    }

    /// OpenID Connect discovery document.
    pub fn discovery(&self) -> serde_json::Value {
        let config = &self.config;
        serde_json::json!({
            "issuer": config.issuer_str(),
            "authorization_endpoint": config.endpoint("/authorize"),
            "token_endpoint": config.endpoint("/token"),
            "userinfo_endpoint": config.endpoint("/userinfo"),
            "jwks_uri": config.endpoint("/.well-known/jwks.json"),
            "response_types_supported": ["code"],
            "grant_types_supported": ["authorization_code"],
            "code_challenge_methods_supported": ["S256", "plain"],
            "scopes_supported": SUPPORTED_SCOPES,
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": ["ES256"],
            "token_endpoint_auth_methods_supported": ["none"],
        })
    }

    fn approval_location(&self, request_id: &str) -> String {
        let mut url = self.config.approval_url();
        url.push_str("?request=");
        url.push_str(request_id);
        url
    }

    /// Error redirect for a consumed request; never carries the broker's id.
    fn error_location(&self, request: &AuthorizationRequest, code: &str) -> Result<String> {
        let description = match code {
            "access_denied" => "the user declined to sign in",
            _ => "sign-in with the identity provider failed",
        };
        match (&request.client_id, &request.redirect_uri) {
            (Some(_), Some(redirect_uri)) => with_query(
                redirect_uri,
                &[
                    ("error", Some(code)),
                    ("error_description", Some(description)),
                    ("state", request.state.as_deref()),
                ],
            ),
            _ => with_query(&self.config.home_url(), &[("error", Some(code))]),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Keep only supported scopes, falling back to the default set.
fn normalize_scope(requested: Option<&str>) -> String {
    let scopes: Vec<&str> = requested
        .unwrap_or_default()
        .split_whitespace()
        .filter(|s| SUPPORTED_SCOPES.contains(s))
        .collect();
    if scopes.is_empty() {
        DEFAULT_SCOPE.to_string()
    } else {
        scopes.join(" ")
    }
}

fn with_query(base: &str, pairs: &[(&str, Option<&str>)]) -> Result<String> {
    let mut url = Url::parse(base)
        .map_err(|_| Error::InvalidRequest("redirect_uri must be an absolute URL".to_string()))?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in pairs {
            if let Some(value) = value {
                query.append_pair(key, value);
            }
        }
    }
    Ok(url.to_string())
}

/// Opaque, unguessable identifier for requests and codes.
fn generate_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
