//! `/userinfo`, `/introspect`, and `/revoke`.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Extension, Form, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::OAuthError;
use crate::token::{AccessTokenError, parse_scopes, project_claims};

use super::AppState;
use super::context::RequestContext;

/// Pull the bearer token out of the `Authorization` header.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ")
}

/// `GET|POST /userinfo`
///
/// Verifies the bearer access token (audience = the observed `/userinfo`
/// URL), decrypts the sealed upstream token, fetches a *fresh* identity
/// snapshot, and returns the scope-gated claims. `iss`, `aud`, `iat`,
/// `exp`, and `nonce` are never part of this response.
pub(super) async fn userinfo_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
) -> Result<Json<Value>, OAuthError> {
    let bearer = extract_bearer(&headers)
        .ok_or_else(|| OAuthError::invalid_token("Bearer token is required"))?;

    let claims = state
        .tokens
        .verify_access(bearer, &ctx.issuer(), &ctx.userinfo_url())
        .map_err(|e| match e {
            AccessTokenError::NotAnAccessToken => OAuthError::invalid_request(
                "An ID token cannot be used as an access token",
            ),
            AccessTokenError::Invalid => OAuthError::invalid_token("Token verification failed"),
        })?;

    let upstream_token = state
        .tokens
        .unseal_upstream(&claims.token)
        .map_err(|_| OAuthError::invalid_token("Token verification failed"))?;

    let scopes = parse_scopes(&claims.scope);
    let identity = state
        .provider
        .fetch_identity(&upstream_token, &scopes)
        .await
        .map_err(|e| {
            debug!(error = %e, "Identity fetch failed");
            OAuthError::server_error()
        })?;

    let mut body = serde_json::Map::new();
    body.insert("sub".to_string(), Value::from(identity.id.as_str()));
    for (claim, value) in project_claims(&identity, &scopes) {
        body.insert(claim, value);
    }

    Ok(Json(Value::Object(body)))
}

/// Form body of `POST /introspect`.
#[derive(Debug, Deserialize)]
pub(super) struct IntrospectForm {
    token: Option<String>,
}

/// `POST /introspect` — RFC 7662.
///
/// An invalid or expired token yields `{"active": false}`, not an error.
/// `sub` is the upstream user ID, not the client ID. Client authentication
/// is not required here (RFC 7662 recommends it; the original service
/// exposed the endpoint unauthenticated and this keeps that contract).
pub(super) async fn introspect_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Form(form): Form<IntrospectForm>,
) -> Result<Json<Value>, OAuthError> {
    let token = form
        .token
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("token is required"))?;

    match state
        .tokens
        .verify_access(token, &ctx.issuer(), &ctx.userinfo_url())
    {
        Ok(claims) => Ok(Json(json!({
            "active": true,
            "sub": claims.sub,
            "scope": claims.scope,
            "iss": claims.iss,
            "aud": claims.aud,
            "iat": claims.iat,
            "exp": claims.exp,
            "token_type": "Bearer",
        }))),
        Err(_) => Ok(Json(json!({ "active": false }))),
    }
}

/// Form body of `POST /revoke`.
#[derive(Debug, Deserialize)]
pub(super) struct RevokeForm {
    token: Option<String>,
}

/// `POST /revoke` — RFC 7009.
///
/// Holding a valid refresh token is the only credential required, matching
/// `/introspect`'s unauthenticated posture; the token is verified on its own
/// signature and issuer, without pinning the audience. Refresh tokens are
/// revoked by consuming their JTI; access and ID tokens are stateless JWS,
/// so revoking them is a no-op. Per the RFC the response is 200 regardless
/// of whether the token meant anything.
pub(super) async fn revoke_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Form(form): Form<RevokeForm>,
) -> Json<Value> {
    if let Some(token) = form.token.as_deref() {
        if let Ok(claims) = state.tokens.decode_refresh(token, &ctx.issuer()) {
            state.stores.mark_refresh_consumed(&claims.jti);
            debug!(jti = %claims.jti, "Refresh token revoked");
        }
    }

    Json(json!({}))
}
