use crate::{
    auth::axum_extractors::{Bearer, Session},
    broker::{AuthorizationOrchestrator, AuthorizeParams, CallbackParams, TokenRequest},
    config::BrokerConfig,
    error::{Error, Result},
    session::SessionCookie,
    store::StateStore,
    token::TokenService,
    upstream::{HttpUpstream, UpstreamIdentityBroker},
    users::UserLookup,
};
use axum::{
    Json, Router,
    extract::{FromRequestParts, Query, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION, PRAGMA, SET_COOKIE},
        request::Parts,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::sync::Arc;

/// HTTP front of the broker: OIDC provider endpoints plus the browser
/// session and approval endpoints used by the local web app.
#[derive(Clone)]
pub struct BrokerServer {
    broker: AuthorizationOrchestrator,
    session: SessionCookie,
}

impl BrokerServer {
    pub fn builder() -> BrokerServerBuilder {
        BrokerServerBuilder::default()
    }

    pub fn new(broker: AuthorizationOrchestrator) -> Self {
        let config = broker.config();
        let session = SessionCookie::new(
            config.session_cookie_name.clone(),
            config.access_token_ttl_seconds,
        );
        Self { broker, session }
    }

    pub fn broker(&self) -> &AuthorizationOrchestrator {
        &self.broker
    }

    pub fn session_cookie(&self) -> &SessionCookie {
        &self.session
    }

    /// Create the axum router with all broker endpoints.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/.well-known/openid-configuration", get(handle_discovery))
            .route("/.well-known/jwks.json", get(handle_jwks))
            .route("/authorize", get(handle_authorize))
            .route("/authorize/request", get(handle_approval_request))
            .route("/authorize/decision", post(handle_decision))
            .route("/login", get(handle_login))
            .route("/callback", get(handle_callback))
            .route("/token", post(handle_token))
            .route("/userinfo", get(handle_userinfo))
            .route("/logout", post(handle_logout))
            .route("/health", get(handle_health))
            .with_state(self.clone())
    }
}

/// Query string extractor that rejects with an OAuth `invalid_request` body.
struct OAuthQuery<T>(T);

impl<S, T> FromRequestParts<S> for OAuthQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| OAuthQuery(value))
            .map_err(|rejection| Error::InvalidRequest(rejection.body_text()))
    }
}

async fn handle_discovery(State(server): State<BrokerServer>) -> Result<Response> {
    Ok((StatusCode::OK, Json(server.broker.discovery())).into_response())
}

async fn handle_jwks(State(server): State<BrokerServer>) -> Result<Response> {
    let jwks = server.broker.tokens().jwks().clone();
    Ok((
        StatusCode::OK,
        [(CACHE_CONTROL, HeaderValue::from_static("public, max-age=3600"))],
        Json(jwks),
    )
        .into_response())
}

async fn handle_authorize(
    State(server): State<BrokerServer>,
    Session(session): Session,
    OAuthQuery(params): OAuthQuery<AuthorizeParams>,
) -> Result<Response> {
    tracing::info!(
        "authorize request: client_id={:?}, redirect_uri={:?}",
        params.client_id,
        params.redirect_uri
    );
    let location = server.broker.authorize(params, session).await?;
    found(&location)
}

async fn handle_login(
    State(server): State<BrokerServer>,
    Session(session): Session,
) -> Result<Response> {
    let location = server.broker.login(session).await?;
    found(&location)
}

async fn handle_callback(
    State(server): State<BrokerServer>,
    OAuthQuery(params): OAuthQuery<CallbackParams>,
) -> Result<Response> {
    tracing::info!("handling upstream callback");
    let outcome = server.broker.callback(params).await?;

    let mut response = found(&outcome.location)?;
    if let Some(token) = outcome.session_token {
        response
            .headers_mut()
            .append(SET_COOKIE, header_value(&server.session.set(&token))?);
    }
    Ok(response)
}

#[derive(Deserialize)]
struct ApprovalQuery {
    request: Option<String>,
}

async fn handle_approval_request(
    State(server): State<BrokerServer>,
    Session(session): Session,
    OAuthQuery(query): OAuthQuery<ApprovalQuery>,
) -> Result<Response> {
    let view = server
        .broker
        .approval_request(query.request.as_deref(), session)
        .await?;
    Ok((StatusCode::OK, Json(view)).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionRequest {
    request_id: Option<String>,
    approved: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DecisionResponse {
    redirect_url: String,
}

async fn handle_decision(
    State(server): State<BrokerServer>,
    Session(session): Session,
    body: String,
) -> Result<Response> {
    if session.is_none() {
        return Err(Error::Unauthorized);
    }

    let decision: DecisionRequest = serde_json::from_str(&body)
        .map_err(|e| Error::InvalidRequest(format!("invalid JSON: {}", e)))?;
    let request_id = decision
        .request_id
        .ok_or_else(|| Error::InvalidRequest("missing requestId".to_string()))?;
    let approved = decision
        .approved
        .ok_or_else(|| Error::InvalidRequest("missing approved".to_string()))?;

    let redirect_url = server
        .broker
        .decision(&request_id, approved, session)
        .await?;
    Ok((StatusCode::OK, Json(DecisionResponse { redirect_url })).into_response())
}

async fn handle_token(
    State(server): State<BrokerServer>,
    headers: HeaderMap,
    body: String,
) -> Response {
    tracing::info!("handling token request");

    let result = match parse_token_request(&headers, &body) {
        Ok(request) => server.broker.token(request).await,
        Err(e) => Err(e),
    };

    let mut response = match result {
        Ok(tokens) => (StatusCode::OK, Json(tokens)).into_response(),
        Err(e) => e.into_response(),
    };
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// Token requests arrive as JSON from the CLI and as forms from generic clients.
fn parse_token_request(headers: &HeaderMap, body: &str) -> Result<TokenRequest> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("application/json"));

    if is_json {
        serde_json::from_str(body)
            .map_err(|e| Error::InvalidRequest(format!("invalid JSON: {}", e)))
    } else {
        serde_urlencoded::from_str(body)
            .map_err(|e| Error::InvalidRequest(format!("invalid form data: {}", e)))
    }
}

async fn handle_userinfo(
    State(server): State<BrokerServer>,
    Bearer(token): Bearer,
) -> Result<Response> {
    let user = server.broker.userinfo(token.as_deref()).await?;
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "sub": user.id.to_string(),
            "email": user.email,
            "name": user.name,
        })),
    )
        .into_response())
}

async fn handle_logout(State(server): State<BrokerServer>) -> Result<Response> {
    Ok((
        StatusCode::NO_CONTENT,
        [(SET_COOKIE, header_value(&server.session.clear())?)],
    )
        .into_response())
}

async fn handle_health() -> &'static str {
    "ok"
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::Internal(format!("invalid header value: {}", e)))
}

fn found(location: &str) -> Result<Response> {
    Ok((StatusCode::FOUND, [(LOCATION, header_value(location)?)]).into_response())
}

/// Builder for [`BrokerServer`].
#[derive(Default)]
pub struct BrokerServerBuilder {
    config: Option<BrokerConfig>,
    state_store: Option<Arc<dyn StateStore>>,
    user_store: Option<Arc<dyn UserLookup>>,
    upstream: Option<Arc<dyn UpstreamIdentityBroker>>,
    token_service: Option<Arc<TokenService>>,
}

impl BrokerServerBuilder {
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn user_store(mut self, store: Arc<dyn UserLookup>) -> Self {
        self.user_store = Some(store);
        self
    }

    /// Replace the HTTP upstream client built from the config.
    pub fn upstream(mut self, upstream: Arc<dyn UpstreamIdentityBroker>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Replace the token service built from the config's PEM keys.
    pub fn token_service(mut self, tokens: Arc<TokenService>) -> Self {
        self.token_service = Some(tokens);
        self
    }

    pub fn build(self) -> Result<BrokerServer> {
        let config = self
            .config
            .ok_or_else(|| Error::Config("config required".to_string()))?;
        let state_store = self
            .state_store
            .ok_or_else(|| Error::Config("state_store required".to_string()))?;
        let user_store = self
            .user_store
            .ok_or_else(|| Error::Config("user_store required".to_string()))?;

        let tokens = match self.token_service {
            Some(tokens) => tokens,
            None => Arc::new(TokenService::new(&config)?),
        };
        let upstream: Arc<dyn UpstreamIdentityBroker> = match self.upstream {
            Some(upstream) => upstream,
            None => Arc::new(HttpUpstream::new(config.upstream.clone())?),
        };

        tracing::info!(
            "broker configured: issuer={}, clients={:?}",
            config.issuer_str(),
            config.allowed_clients
        );

        let broker =
            AuthorizationOrchestrator::new(config, state_store, tokens, upstream, user_store);
        Ok(BrokerServer::new(broker))
    }
}
