//! Per-request context: the observed scheme, host, and base path.
//!
//! Every URL Takagi emits — the issuer, endpoint URLs in discovery, token
//! audiences — is derived from what the current request observed, never from
//! baked-in hostnames. The middleware here also enforces the two checks that
//! gate every route: the host allowlist and the HTTPS requirement.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use url::Url;

use crate::error::OAuthError;
use crate::policy;

use super::AppState;

/// Immutable facts about the current request, derived once by
/// [`context_middleware`] and read by every handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Observed scheme (`http` or `https`), honoring `X-Forwarded-Proto`
    pub scheme: String,
    /// Observed authority (host, possibly with port), honoring `X-Forwarded-Host`
    pub authority: String,
    /// Configured base path (`""` when mounted at the root)
    pub base_path: String,
    /// `Referer` header, captured for return-to-referrer denials
    pub referer: Option<String>,
}

impl RequestContext {
    /// The observed base URL with a trailing slash; this is the issuer.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("{}://{}{}/", self.scheme, self.authority, self.base_path)
    }

    /// Absolute URL of an endpoint under the observed base.
    #[must_use]
    pub fn url_for(&self, path: &str) -> String {
        format!("{}://{}{}/{path}", self.scheme, self.authority, self.base_path)
    }

    /// The issuer URL (alias of [`RequestContext::base_url`]).
    #[must_use]
    pub fn issuer(&self) -> String {
        self.base_url()
    }

    /// Absolute URL of `/userinfo`, the access-token audience.
    #[must_use]
    pub fn userinfo_url(&self) -> String {
        self.url_for("userinfo")
    }

    /// Absolute URL of the `/r` callback endpoint (without trailing slash).
    #[must_use]
    pub fn redirect_endpoint(&self) -> String {
        self.url_for("r")
    }
}

/// Build the [`RequestContext`] and enforce host + transport policy.
///
/// Rejections happen before any handler runs and never redirect: a request
/// with a bad host must not be bounced anywhere it names.
pub async fn context_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, OAuthError> {
    let headers = request.headers();

    let Some(authority) = observed_authority(headers) else {
        return Err(OAuthError::invalid_request("Missing Host header"));
    };
    let scheme = observed_scheme(headers);

    let hostname = policy::strip_port(&authority).to_string();
    if !policy::host_allowed(&state.settings.allowed_hosts, &hostname) {
        return Err(OAuthError::invalid_request(format!(
            "Host {hostname} is not allowed"
        )));
    }

    let observed = Url::parse(&format!("{scheme}://{authority}/"))
        .map_err(|_| OAuthError::invalid_request("Unparseable Host header"))?;
    if !policy::is_secure_transport(&observed, state.settings.treat_loopback_as_secure) {
        return Err(OAuthError::invalid_request(format!(
            "{} must be served over HTTPS",
            state.provider.kind().service_name()
        )));
    }

    let referer = headers
        .get("referer")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let context = RequestContext {
        scheme,
        authority,
        base_path: state.settings.base_path.clone(),
        referer,
    };
    request.extensions_mut().insert(context);

    Ok(next.run(request).await)
}

/// The authority the client used, preferring `X-Forwarded-Host` from a
/// fronting proxy over the raw `Host` header.
fn observed_authority(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The scheme the client used, per `X-Forwarded-Proto` when present.
fn observed_scheme(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .filter(|v| v == "https" || v == "http")
        .unwrap_or_else(|| "http".to_string())
}
