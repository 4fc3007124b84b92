//! Error types for Takagi

use std::io;

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use thiserror::Error;
use url::Url;

/// Result type alias for Takagi
pub type Result<T> = std::result::Result<T, Error>;

/// Takagi errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Keyset error (generation, validation, persistence)
    #[error("Keyset error: {0}")]
    Keyset(String),

    /// Upstream provider error
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// JWT signing or verification error
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// JWE decryption failed (wrong key, tampered ciphertext, bad format)
    #[error("Decryption failed")]
    Decrypt,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// OAuth2 / OIDC error codes surfaced to clients.
///
/// The wire names follow RFC 6749 §5.2 and OIDC Core 1.0 §3.1.2.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorKind {
    /// Malformed or contradictory request parameters
    InvalidRequest,
    /// Client authentication failed
    InvalidClient,
    /// Invalid, expired, replayed, or mismatched grant
    InvalidGrant,
    /// Grant type not supported by the token endpoint
    UnsupportedGrantType,
    /// Requested scope set is invalid (e.g. missing `openid`)
    InvalidScope,
    /// Client is not on the allowlist
    UnauthorizedClient,
    /// The user denied the authorization request upstream
    AccessDenied,
    /// Bearer token failed verification
    InvalidToken,
    /// Unexpected internal failure
    ServerError,
}

impl OAuthErrorKind {
    /// The OAuth2 `error` code as it appears on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidScope => "invalid_scope",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::AccessDenied => "access_denied",
            Self::InvalidToken => "invalid_token",
            Self::ServerError => "server_error",
        }
    }

    /// The HTTP status this error maps to when returned directly.
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// A request-time error in OAuth2 wire format.
///
/// Internal failures are mapped to one of these before anything leaves the
/// process; the description never carries internal details for
/// `server_error`.
#[derive(Debug)]
pub struct OAuthError {
    /// OAuth2 error code
    pub kind: OAuthErrorKind,
    /// Human-readable `error_description`
    pub description: String,
}

impl OAuthError {
    /// Create an error with the given code and description.
    pub fn new(kind: OAuthErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// `invalid_request` shorthand.
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorKind::InvalidRequest, description)
    }

    /// `invalid_grant` shorthand.
    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorKind::InvalidGrant, description)
    }

    /// `invalid_token` shorthand (401 with a `WWW-Authenticate` challenge).
    pub fn invalid_token(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorKind::InvalidToken, description)
    }

    /// `server_error` with a canned description.
    #[must_use]
    pub fn server_error() -> Self {
        Self::new(OAuthErrorKind::ServerError, "An internal error occurred")
    }

    /// Append this error to a redirect URI as `error`/`error_description`
    /// query parameters, per OIDC Core 1.0 §3.1.2.6.
    ///
    /// The relying party's `state` is echoed when present.
    #[must_use]
    pub fn into_redirect(self, redirect_uri: &Url, state: Option<&str>) -> Url {
        let mut url = redirect_uri.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("error", self.kind.as_str());
            query.append_pair("error_description", &self.description);
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }
        url
    }
}

impl std::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.description)
    }
}

impl From<Error> for OAuthError {
    /// Map internal errors to wire errors. Everything unexpected becomes
    /// `server_error` without leaking the underlying message.
    fn from(err: Error) -> Self {
        match err {
            Error::Jwt(_) | Error::Decrypt => Self::invalid_token("Token verification failed"),
            Error::Upstream(_) | Error::Http(_) => Self::new(
                OAuthErrorKind::ServerError,
                "The upstream provider request failed",
            ),
            _ => Self::server_error(),
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(json!({
            "error": self.kind.as_str(),
            "error_description": self.description,
        }));

        if self.kind == OAuthErrorKind::InvalidToken {
            let challenge = format!("Bearer error=\"{}\"", self.kind.as_str());
            return (self.kind.status(), [("WWW-Authenticate", challenge)], body).into_response();
        }

        (self.kind.status(), body).into_response()
    }
}
