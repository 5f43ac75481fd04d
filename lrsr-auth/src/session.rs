//! The broker's own browser session cookie.

use cookie::{Cookie, SameSite};
use http::HeaderMap;
use http::header::COOKIE;

/// Reads and writes the session cookie that carries a broker-issued token.
#[derive(Debug, Clone)]
pub struct SessionCookie {
    name: String,
    max_age_seconds: i64,
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, max_age_seconds: i64) -> Self {
        Self {
            name: name.into(),
            max_age_seconds,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session token from the request's `Cookie` headers, if any.
    pub fn read(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(|cookie| cookie.ok())
            .find(|cookie| cookie.name() == self.name && !cookie.value().is_empty())
            .map(|cookie| cookie.value().to_string())
    }

    /// `Set-Cookie` value establishing the session.
    pub fn set(&self, token: &str) -> String {
        self.build(token.to_string(), self.max_age_seconds)
    }

    /// `Set-Cookie` value removing the session.
    pub fn clear(&self) -> String {
        self.build(String::new(), 0)
    }

    fn build(&self, value: String, max_age_seconds: i64) -> String {
        Cookie::build((self.name.clone(), value))
            .http_only(true)
            .secure(true)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(cookie::time::Duration::seconds(max_age_seconds))
            .build()
            .to_string()
    }
}
