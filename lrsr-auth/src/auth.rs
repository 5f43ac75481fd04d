//! Credential extraction for incoming requests.
//!
//! Browsers authenticate with the session cookie, API clients with a bearer
//! token. Both carry the same kind of broker-issued token.

use http::HeaderMap;
use http::header::AUTHORIZATION;

/// Extracts a bearer token from an Authorization header value.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    let (scheme, token) = auth_header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Bearer token from the request's Authorization header, if any.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
}

#[cfg(feature = "axum")]
pub mod axum_extractors {
    //! Axum extractors for authenticated requests.

    use super::bearer_from_headers;
    use crate::server::BrokerServer;
    use crate::token::LocalPrincipal;
    use axum::extract::FromRequestParts;
    use axum::http::request::Parts;
    use std::convert::Infallible;

    /// The user behind the browser session cookie, if it holds a valid token.
    ///
    /// Never rejects; handlers decide what an anonymous request means.
    pub struct Session(pub Option<LocalPrincipal>);

    impl FromRequestParts<BrokerServer> for Session {
        type Rejection = Infallible;

        async fn from_request_parts(
            parts: &mut Parts,
            server: &BrokerServer,
        ) -> Result<Self, Self::Rejection> {
            let token = server.session_cookie().read(&parts.headers);
            Ok(Session(server.broker().authenticate(token.as_deref())))
        }
    }

    /// Raw bearer token from the Authorization header.
    pub struct Bearer(pub Option<String>);

    impl<S: Send + Sync> FromRequestParts<S> for Bearer {
        type Rejection = Infallible;

        async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
            Ok(Bearer(bearer_from_headers(&parts.headers).map(String::from)))
        }
    }
}
