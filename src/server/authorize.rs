//! `/authorize` and the `/r/` upstream callback.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use url::Url;

use crate::error::{OAuthError, OAuthErrorKind};
use crate::flow::{AuthorizationCode, AuthorizationRequest, PkceMethod};
use crate::policy;
use crate::token::parse_scopes;

use super::context::RequestContext;
use super::AppState;

/// Query parameters of `GET /authorize`.
#[derive(Debug, Deserialize)]
pub(super) struct AuthorizeParams {
    client_id: Option<String>,
    response_type: Option<String>,
    redirect_uri: Option<String>,
    scope: Option<String>,
    state: Option<String>,
    nonce: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    /// Per-request override for return-to-referrer on denial
    #[serde(rename = "return")]
    return_to_referrer: Option<bool>,
}

/// Query parameters the upstream provider sends to the callback.
#[derive(Debug, Deserialize)]
pub(super) struct CallbackParams {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// A 302 redirect. The OAuth2 flows use 302 specifically, not axum's
/// 303/307 helpers.
fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => OAuthError::server_error().into_response(),
    }
}

/// Resolve the relying party's real destination and the `/r/`-wrapped URI
/// sent upstream, applying `FIX_REDIRECT_URIS` when enabled.
fn resolve_redirect_uris(
    redirect_endpoint: &str,
    redirect_uri: &str,
    fix_redirect_uris: bool,
) -> Result<(String, String), OAuthError> {
    let prefix = format!("{redirect_endpoint}/");

    if let Some(inner) = redirect_uri.strip_prefix(&prefix) {
        if inner.is_empty() {
            return Err(OAuthError::invalid_request(
                "Redirect URI names the callback endpoint but no destination",
            ));
        }
        return Ok((inner.to_string(), redirect_uri.to_string()));
    }

    if fix_redirect_uris {
        let wrapped = policy::fix_redirect_uri(redirect_endpoint, redirect_uri);
        return Ok((redirect_uri.to_string(), wrapped));
    }

    Err(OAuthError::invalid_request(format!(
        "Redirect URI must be a subpath of {redirect_endpoint} (e.g., {})",
        policy::fix_redirect_uri(redirect_endpoint, redirect_uri)
    )))
}

/// `GET /authorize` — validate the request and bounce the browser to the
/// upstream provider.
///
/// Validation order: host (middleware) → client allowlist → redirect-URI
/// policy → scope set → PKCE method. All failures here answer directly with
/// an OAuth2 error body; nothing is ever redirected to an unvalidated URI.
pub(super) async fn authorize_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Query(params): Query<AuthorizeParams>,
) -> Result<Response, OAuthError> {
    let client_id = params
        .client_id
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("Client ID is required"))?;

    if !policy::client_allowed(&state.settings.allowed_clients, client_id) {
        return Err(OAuthError::new(
            OAuthErrorKind::UnauthorizedClient,
            format!("Client ID {client_id} is not allowed"),
        ));
    }

    let redirect_uri = params
        .redirect_uri
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("Redirect URI is required"))?;
    let parsed_redirect = Url::parse(redirect_uri)
        .map_err(|_| OAuthError::invalid_request("Redirect URI is not a valid URL"))?;
    if !policy::is_secure_transport(&parsed_redirect, state.settings.treat_loopback_as_secure) {
        return Err(OAuthError::invalid_request(format!(
            "Redirect URI {redirect_uri} is insecure. Redirect URIs must be either HTTPS or localhost"
        )));
    }

    let redirect_endpoint = ctx.redirect_endpoint();
    let (rp_redirect_uri, upstream_redirect_uri) = resolve_redirect_uris(
        &redirect_endpoint,
        redirect_uri,
        state.settings.fix_redirect_uris,
    )?;
    // The final destination must itself be a URL we can safely redirect to.
    Url::parse(&rp_redirect_uri)
        .map_err(|_| OAuthError::invalid_request("Redirect URI destination is not a valid URL"))?;

    if params.response_type.as_deref() != Some("code") {
        return Err(OAuthError::invalid_request(
            "response_type must be 'code'",
        ));
    }

    let scope = params
        .scope
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("Scope is required"))?;
    let scopes = parse_scopes(scope);
    if !scopes.iter().any(|s| s == "openid") {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidScope,
            "openid scope is required",
        ));
    }

    let code_challenge_method = match (&params.code_challenge, &params.code_challenge_method) {
        (Some(_), Some(raw)) => Some(PkceMethod::parse(raw).ok_or_else(|| {
            OAuthError::invalid_request("code_challenge_method must be 'S256' or 'plain'")
        })?),
        // RFC 7636: a challenge without a method means `plain`.
        (Some(_), None) => Some(PkceMethod::Plain),
        (None, _) => None,
    };

    let transaction = AuthorizationRequest {
        client_id: client_id.to_string(),
        scopes: scopes.clone(),
        rp_redirect_uri,
        upstream_redirect_uri: upstream_redirect_uri.clone(),
        state: params.state.clone(),
        nonce: params.nonce.clone(),
        code_challenge: params.code_challenge.clone(),
        code_challenge_method,
        referer: ctx.referer.clone(),
        return_to_referrer: params
            .return_to_referrer
            .unwrap_or(state.settings.return_to_referrer),
        issuer: ctx.issuer(),
        expires_at: state.stores.expiry_from_now(),
    };
    let state_ref = state.stores.insert_transaction(transaction);

    let mut upstream_url = Url::parse(state.provider.authorize_endpoint())
        .map_err(|_| OAuthError::server_error())?;
    {
        let mut query = upstream_url.query_pairs_mut();
        query.append_pair("response_type", "code");
        query.append_pair("client_id", client_id);
        query.append_pair("redirect_uri", &upstream_redirect_uri);
        query.append_pair("state", &state_ref);

        let upstream_scope = state.provider.translate_scopes(&scopes);
        if !upstream_scope.is_empty() {
            query.append_pair("scope", &upstream_scope);
        }

        // PKCE is enforced locally and forwarded upstream as well.
        if let Some(challenge) = &params.code_challenge {
            query.append_pair("code_challenge", challenge);
            if let Some(method) = code_challenge_method {
                query.append_pair("code_challenge_method", method.as_str());
            }
        }
    }

    Ok(found(upstream_url.as_str()))
}

/// `GET /r/{redirect_uri}` — the upstream provider's callback.
///
/// Consumes the transaction referenced by `state` (exactly once), issues a
/// Takagi authorization code, and sends the browser to the relying party.
/// The authoritative destination is the one captured at `/authorize`; the
/// callback path is only checked for consistency, never trusted.
pub(super) async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(redirect_uri): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, OAuthError> {
    let state_ref = params
        .state
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("state is required"))?;

    let transaction = state
        .stores
        .consume_transaction(state_ref)
        .ok_or_else(|| {
            OAuthError::invalid_request("Unknown or expired authorization request")
        })?;

    let observed_callback = format!("{}/{redirect_uri}", ctx.redirect_endpoint());
    if observed_callback != transaction.upstream_redirect_uri {
        return Err(OAuthError::invalid_request(
            "Redirect URI does not match what was sent at authorization",
        ));
    }

    let rp_redirect = Url::parse(&transaction.rp_redirect_uri)
        .map_err(|_| OAuthError::server_error())?;

    if let Some(error) = params.error.as_deref() {
        // Denials may return to the page that started the flow instead of
        // bothering the relying party.
        if error == "access_denied" && transaction.return_to_referrer {
            if let Some(referer) = &transaction.referer {
                return Ok(found(referer));
            }
        }

        let description = params
            .error_description
            .unwrap_or_else(|| "The upstream provider reported an error".to_string());
        let kind = if error == "access_denied" {
            OAuthErrorKind::AccessDenied
        } else {
            OAuthErrorKind::ServerError
        };
        let target = OAuthError::new(kind, description)
            .into_redirect(&rp_redirect, transaction.state.as_deref());
        return Ok(found(target.as_str()));
    }

    let Some(upstream_code) = params.code else {
        return Err(OAuthError::invalid_request(
            "Callback carried neither a code nor an error",
        ));
    };

    let code = state.stores.insert_code(AuthorizationCode {
        upstream_code,
        upstream_redirect_uri: transaction.upstream_redirect_uri,
        client_id: transaction.client_id,
        rp_redirect_uri: transaction.rp_redirect_uri,
        scopes: transaction.scopes,
        nonce: transaction.nonce,
        code_challenge: transaction.code_challenge,
        code_challenge_method: transaction.code_challenge_method,
        expires_at: state.stores.expiry_from_now(),
    });

    let mut target = rp_redirect;
    {
        let mut query = target.query_pairs_mut();
        query.append_pair("code", &code);
        if let Some(rp_state) = &transaction.state {
            query.append_pair("state", rp_state);
        }
    }

    Ok(found(target.as_str()))
}
