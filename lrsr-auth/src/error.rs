pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // OAuth errors
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized_client")]
    UnauthorizedClient,
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    #[error("unsupported_grant_type")]
    UnsupportedGrantType,
    #[error("access_denied")]
    AccessDenied,

    // Local session errors (approval endpoints)
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,

    // Upstream identity provider errors
    #[error("upstream request failed with status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    // Configuration errors (missing or malformed keys, settings)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// OAuth 2.0 error code reported to downstream clients.
    pub fn oauth_code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::UnauthorizedClient => "unauthorized_client",
            Error::InvalidGrant(_) => "invalid_grant",
            Error::UnsupportedGrantType => "unsupported_grant_type",
            Error::AccessDenied => "access_denied",
            Error::Unauthorized => "unauthorized",
            Error::Forbidden => "forbidden",
            Error::NotFound => "not_found",
            Error::Upstream { .. }
            | Error::Network(_)
            | Error::Storage(_)
            | Error::Config(_)
            | Error::Internal(_) => "server_error",
        }
    }

    /// Human readable description safe to hand to a client.
    ///
    /// Server-side failures are collapsed to a generic message; the details
    /// only go to the log.
    pub fn description(&self) -> Option<String> {
        match self {
            Error::InvalidRequest(msg) | Error::InvalidGrant(msg) => Some(msg.clone()),
            Error::UnauthorizedClient => Some("client is not allowed".to_string()),
            Error::UnsupportedGrantType => {
                Some("only authorization_code is supported".to_string())
            }
            Error::AccessDenied => Some("the user denied the request".to_string()),
            Error::Upstream { .. } | Error::Network(_) => {
                Some("identity provider request failed".to_string())
            }
            Error::Storage(_) | Error::Config(_) | Error::Internal(_) => {
                Some("internal server error".to_string())
            }
            Error::Unauthorized | Error::Forbidden | Error::NotFound => None,
        }
    }

    /// Whether this error originates on the server side rather than the client.
    pub fn is_server_error(&self) -> bool {
        self.oauth_code() == "server_error"
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization failed: {}", e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

// axum IntoResponse implementation
#[cfg(feature = "axum")]
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;
        use axum::http::StatusCode;

        let status = match self {
            Error::InvalidRequest(_)
            | Error::InvalidGrant(_)
            | Error::UnsupportedGrantType
            | Error::AccessDenied => StatusCode::BAD_REQUEST,
            Error::UnauthorizedClient | Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if self.is_server_error() {
            tracing::error!("request failed: {}", self);
        }

        let body = match self.description() {
            Some(description) => serde_json::json!({
                "error": self.oauth_code(),
                "error_description": description,
            }),
            None => serde_json::json!({ "error": self.oauth_code() }),
        };

        (status, Json(body)).into_response()
    }
}
