//! `POST /token` — code redemption and refresh.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Extension, Form, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OAuthError, OAuthErrorKind};
use crate::flow::store::unix_now;
use crate::flow::verify_pkce;
use crate::policy;
use crate::token::{MintRequest, parse_scopes};
use crate::upstream::ClientCredentials;
use crate::Error;

use super::AppState;
use super::context::RequestContext;

/// Form body of `POST /token`.
#[derive(Debug, Default, Deserialize)]
pub(super) struct TokenForm {
    grant_type: Option<String>,
    code: Option<String>,
    redirect_uri: Option<String>,
    code_verifier: Option<String>,
    refresh_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

/// Successful token response per RFC 6749 §5.1.
#[derive(Debug, Serialize)]
pub(super) struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in: Option<u64>,
    refresh_token: String,
    id_token: String,
    scope: String,
}

/// Extract client credentials from HTTP Basic *or* the form body.
///
/// Presenting both at once is a 400 by explicit policy; silently preferring
/// one would mask client misconfiguration.
fn extract_client_auth(
    headers: &HeaderMap,
    form: &TokenForm,
) -> Result<(String, String), OAuthError> {
    let basic = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic);

    let form_creds = form.client_id.is_some() || form.client_secret.is_some();
    if basic.is_some() && form_creds {
        return Err(OAuthError::invalid_request(
            "You cannot supply client credentials via both form fields and \
             HTTP Basic authentication at the same time",
        ));
    }

    if let Some((id, secret)) = basic {
        return Ok((id, secret));
    }

    let id = form
        .client_id
        .clone()
        .ok_or_else(|| OAuthError::invalid_request("Client ID is required"))?;
    let secret = form
        .client_secret
        .clone()
        .ok_or_else(|| OAuthError::invalid_request("Client secret is required"))?;
    Ok((id, secret))
}

/// Parse an `Authorization: Basic` header into `(username, password)`.
fn parse_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Map an upstream token-endpoint failure onto the right OAuth2 error code.
fn map_upstream_error(err: Error) -> OAuthError {
    let message = err.to_string();
    if message.contains("incorrect_client_credentials") || message.contains("invalid_client") {
        return OAuthError::new(
            OAuthErrorKind::InvalidClient,
            "The upstream provider rejected the client credentials",
        );
    }
    if message.contains("bad_verification_code")
        || message.contains("invalid_grant")
        || message.contains("expired")
    {
        return OAuthError::invalid_grant("The upstream provider rejected the code");
    }
    debug!(error = %message, "Upstream token request failed");
    OAuthError::new(
        OAuthErrorKind::ServerError,
        "The upstream provider request failed",
    )
}

/// `POST /token`
pub(super) async fn token_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Result<Json<TokenResponse>, OAuthError> {
    let (client_id, client_secret) = extract_client_auth(&headers, &form)?;

    if !policy::client_allowed(&state.settings.allowed_clients, &client_id) {
        return Err(OAuthError::new(
            OAuthErrorKind::UnauthorizedClient,
            format!("Client ID {client_id} is not allowed"),
        ));
    }
    let credentials = ClientCredentials {
        id: &client_id,
        secret: &client_secret,
    };

    match form.grant_type.as_deref() {
        Some("authorization_code") => {
            redeem_code(&state, &ctx, credentials, &form).await
        }
        Some("refresh_token") => refresh(&state, &ctx, credentials, &form).await,
        Some(other) => Err(OAuthError::new(
            OAuthErrorKind::UnsupportedGrantType,
            format!("Unsupported grant type {other}"),
        )),
        None => Err(OAuthError::invalid_request("grant_type is required")),
    }
}

/// `grant_type=authorization_code`
async fn redeem_code(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    credentials: ClientCredentials<'_>,
    form: &TokenForm,
) -> Result<Json<TokenResponse>, OAuthError> {
    let code = form
        .code
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("Authorization code is required"))?;

    // Atomic consumption: a replayed or expired code is indistinguishable
    // from an unknown one.
    let record = state
        .stores
        .consume_code(code)
        .ok_or_else(|| OAuthError::invalid_grant("Invalid authorization code"))?;

    if record.client_id != credentials.id {
        return Err(OAuthError::invalid_grant(
            "The code was issued to a different client",
        ));
    }

    let redirect_uri = form.redirect_uri.as_deref().ok_or_else(|| {
        OAuthError::invalid_request("Redirect URI is required since it was sent at authorization")
    })?;
    if redirect_uri != record.rp_redirect_uri && redirect_uri != record.upstream_redirect_uri {
        return Err(OAuthError::invalid_grant(
            "Redirect URI does not match what was sent at authorization",
        ));
    }

    if let (Some(challenge), Some(method)) =
        (&record.code_challenge, record.code_challenge_method)
    {
        let verifier = form
            .code_verifier
            .as_deref()
            .ok_or_else(|| OAuthError::invalid_request("code_verifier is required"))?;
        if !verify_pkce(method, challenge, verifier) {
            return Err(OAuthError::invalid_grant("PKCE verification failed"));
        }
    }

    let upstream_token = state
        .provider
        .exchange_code(
            credentials,
            &record.upstream_code,
            &record.upstream_redirect_uri,
            form.code_verifier.as_deref(),
        )
        .await
        .map_err(map_upstream_error)?;

    let identity = state
        .provider
        .fetch_identity(&upstream_token, &record.scopes)
        .await
        .map_err(|e| {
            debug!(error = %e, "Identity fetch failed");
            OAuthError::server_error()
        })?;

    let tokens = state
        .tokens
        .mint(
            &MintRequest {
                identity: &identity,
                upstream_token: &upstream_token,
                client_id: credentials.id,
                scopes: &record.scopes,
                nonce: record.nonce.as_deref(),
                issuer: &ctx.issuer(),
                userinfo_url: &ctx.userinfo_url(),
            },
            unix_now() as i64,
        )
        .map_err(OAuthError::from)?;

    Ok(Json(TokenResponse {
        access_token: tokens.access_token,
        token_type: "Bearer",
        expires_in: tokens.expires_in,
        refresh_token: tokens.refresh_token,
        id_token: tokens.id_token,
        scope: record.scopes.join(" "),
    }))
}

/// `grant_type=refresh_token`
async fn refresh(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    credentials: ClientCredentials<'_>,
    form: &TokenForm,
) -> Result<Json<TokenResponse>, OAuthError> {
    let refresh_token = form
        .refresh_token
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("refresh_token is required"))?;

    // The audience check binds the token to the client that earned it.
    let claims = state
        .tokens
        .verify_refresh(refresh_token, &ctx.issuer(), credentials.id)
        .map_err(|_| OAuthError::invalid_grant("Invalid refresh token"))?;

    if !state.stores.mark_refresh_consumed(&claims.jti) {
        return Err(OAuthError::invalid_grant(
            "Refresh token has already been used",
        ));
    }

    let sealed = state
        .tokens
        .unseal_upstream(&claims.token)
        .map_err(|_| OAuthError::invalid_grant("Invalid refresh token"))?;

    // Providers that rotate upstream tokens get a fresh one; GitHub tokens
    // never expire by default and are reused as-is.
    let upstream_token = match &sealed.refresh_token {
        Some(upstream_refresh) => state
            .provider
            .refresh(credentials, upstream_refresh)
            .await
            .map_err(map_upstream_error)?,
        None => sealed,
    };

    let scopes = parse_scopes(&claims.scope);
    let identity = state
        .provider
        .fetch_identity(&upstream_token, &scopes)
        .await
        .map_err(|e| {
            debug!(error = %e, "Identity fetch failed");
            OAuthError::server_error()
        })?;

    let tokens = state
        .tokens
        .mint(
            &MintRequest {
                identity: &identity,
                upstream_token: &upstream_token,
                client_id: credentials.id,
                scopes: &scopes,
                nonce: None,
                issuer: &ctx.issuer(),
                userinfo_url: &ctx.userinfo_url(),
            },
            unix_now() as i64,
        )
        .map_err(OAuthError::from)?;

    Ok(Json(TokenResponse {
        access_token: tokens.access_token,
        token_type: "Bearer",
        expires_in: tokens.expires_in,
        refresh_token: tokens.refresh_token,
        id_token: tokens.id_token,
        scope: claims.scope,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{AuthorizationCode, PkceMethod};
    use crate::server::test_support::{request_context, test_state};
    use axum::http::HeaderValue;

    fn form(overrides: impl FnOnce(&mut TokenForm)) -> TokenForm {
        let mut form = TokenForm {
            grant_type: Some("authorization_code".to_string()),
            code: None,
            redirect_uri: Some("https://app.example/cb".to_string()),
            code_verifier: None,
            refresh_token: None,
            client_id: Some("client-1".to_string()),
            client_secret: Some("secret".to_string()),
        };
        overrides(&mut form);
        form
    }

    fn seed_code(
        state: &Arc<super::super::AppState>,
        overrides: impl FnOnce(&mut AuthorizationCode),
    ) -> String {
        let mut record = AuthorizationCode {
            upstream_code: "gh-code".to_string(),
            upstream_redirect_uri: "https://takagi.example/r/https://app.example/cb"
                .to_string(),
            client_id: "client-1".to_string(),
            rp_redirect_uri: "https://app.example/cb".to_string(),
            scopes: vec!["openid".to_string()],
            nonce: None,
            code_challenge: None,
            code_challenge_method: None,
            expires_at: state.stores.expiry_from_now(),
        };
        overrides(&mut record);
        state.stores.insert_code(record)
    }

    // =========================================================================
    // Client authentication
    // =========================================================================

    #[test]
    fn parse_basic_decodes_credentials() {
        // "client-1:secret"
        let header = format!("Basic {}", STANDARD.encode("client-1:secret"));
        assert_eq!(
            parse_basic(&header),
            Some(("client-1".to_string(), "secret".to_string()))
        );
        assert_eq!(parse_basic("Bearer token"), None);
        assert_eq!(parse_basic("Basic !!!"), None);
    }

    #[test]
    fn both_credential_channels_is_an_error() {
        // GIVEN: HTTP Basic and form credentials at once
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", STANDARD.encode("client-1:secret"));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        let form = form(|_| {});

        // THEN: 400 invalid_request by explicit policy
        let err = extract_client_auth(&headers, &form).unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::InvalidRequest);
        assert!(err.description.contains("both"));
    }

    #[test]
    fn missing_client_id_is_an_error() {
        let headers = HeaderMap::new();
        let form = form(|f| {
            f.client_id = None;
            f.client_secret = None;
        });

        let err = extract_client_auth(&headers, &form).unwrap_err();
        assert!(err.description.contains("Client ID"));
    }

    #[test]
    fn basic_credentials_alone_are_accepted() {
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", STANDARD.encode("client-1:secret"));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        let form = form(|f| {
            f.client_id = None;
            f.client_secret = None;
        });

        let (id, secret) = extract_client_auth(&headers, &form).unwrap();
        assert_eq!(id, "client-1");
        assert_eq!(secret, "secret");
    }

    // =========================================================================
    // Grant dispatch
    // =========================================================================

    #[tokio::test]
    async fn unsupported_grant_type_is_rejected() {
        let state = test_state(|_| {});
        let err = token_handler(
            State(state),
            Extension(request_context("https", "takagi.example")),
            HeaderMap::new(),
            Form(form(|f| f.grant_type = Some("client_credentials".to_string()))),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, OAuthErrorKind::UnsupportedGrantType);
    }

    #[tokio::test]
    async fn disallowed_client_is_rejected() {
        let state = test_state(|s| s.allowed_clients = vec!["other".to_string()]);
        let err = token_handler(
            State(state),
            Extension(request_context("https", "takagi.example")),
            HeaderMap::new(),
            Form(form(|_| {})),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, OAuthErrorKind::UnauthorizedClient);
    }

    // =========================================================================
    // Code redemption (paths that fail before any upstream call)
    // =========================================================================

    #[tokio::test]
    async fn unknown_code_is_invalid_grant() {
        let state = test_state(|_| {});
        let err = token_handler(
            State(state),
            Extension(request_context("https", "takagi.example")),
            HeaderMap::new(),
            Form(form(|f| f.code = Some("no-such-code".to_string()))),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
    }

    #[tokio::test]
    async fn code_issued_to_another_client_is_invalid_grant() {
        let state = test_state(|_| {});
        let code = seed_code(&state, |c| c.client_id = "someone-else".to_string());

        let err = token_handler(
            State(state),
            Extension(request_context("https", "takagi.example")),
            HeaderMap::new(),
            Form(form(|f| f.code = Some(code))),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
    }

    #[tokio::test]
    async fn mismatched_redirect_uri_is_invalid_grant() {
        let state = test_state(|_| {});
        let code = seed_code(&state, |_| {});

        let err = token_handler(
            State(state),
            Extension(request_context("https", "takagi.example")),
            HeaderMap::new(),
            Form(form(|f| {
                f.code = Some(code);
                f.redirect_uri = Some("https://evil.example/cb".to_string());
            })),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
    }

    #[tokio::test]
    async fn recorded_challenge_requires_a_verifier() {
        let state = test_state(|_| {});
        let code = seed_code(&state, |c| {
            c.code_challenge = Some("E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".to_string());
            c.code_challenge_method = Some(PkceMethod::S256);
        });

        let err = token_handler(
            State(state),
            Extension(request_context("https", "takagi.example")),
            HeaderMap::new(),
            Form(form(|f| f.code = Some(code))),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, OAuthErrorKind::InvalidRequest);
        assert!(err.description.contains("code_verifier"));
    }

    #[tokio::test]
    async fn wrong_verifier_is_invalid_grant() {
        let state = test_state(|_| {});
        let code = seed_code(&state, |c| {
            c.code_challenge = Some("E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".to_string());
            c.code_challenge_method = Some(PkceMethod::S256);
        });

        let err = token_handler(
            State(state),
            Extension(request_context("https", "takagi.example")),
            HeaderMap::new(),
            Form(form(|f| {
                f.code = Some(code);
                f.code_verifier = Some("wrong".to_string());
            })),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
        assert!(err.description.contains("PKCE"));
    }

    // =========================================================================
    // Refresh grant
    // =========================================================================

    #[tokio::test]
    async fn garbage_refresh_token_is_invalid_grant() {
        let state = test_state(|_| {});
        let err = token_handler(
            State(state),
            Extension(request_context("https", "takagi.example")),
            HeaderMap::new(),
            Form(form(|f| {
                f.grant_type = Some("refresh_token".to_string());
                f.refresh_token = Some("not-a-jwt".to_string());
            })),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
    }

    #[tokio::test]
    async fn consumed_refresh_jti_is_rejected() {
        // GIVEN: a real refresh token whose JTI was already redeemed
        let state = test_state(|_| {});
        let identity = crate::upstream::Identity {
            id: "1".to_string(),
            username: "octocat".to_string(),
            name: None,
            avatar_url: None,
            profile_url: None,
            updated_at: None,
            email: None,
            email_verified: None,
            groups: Vec::new(),
        };
        let upstream = crate::upstream::UpstreamToken {
            access_token: "gho_x".to_string(),
            token_type: None,
            refresh_token: None,
            expires_in: None,
            scope: None,
        };
        let minted = state
            .tokens
            .mint(
                &MintRequest {
                    identity: &identity,
                    upstream_token: &upstream,
                    client_id: "client-1",
                    scopes: &["openid".to_string()],
                    nonce: None,
                    issuer: "https://takagi.example/",
                    userinfo_url: "https://takagi.example/userinfo",
                },
                unix_now() as i64,
            )
            .unwrap();
        let claims = state
            .tokens
            .verify_refresh(&minted.refresh_token, "https://takagi.example/", "client-1")
            .unwrap();
        state.stores.mark_refresh_consumed(&claims.jti);

        // WHEN: the token is redeemed
        let err = token_handler(
            State(state),
            Extension(request_context("https", "takagi.example")),
            HeaderMap::new(),
            Form(form(|f| {
                f.grant_type = Some("refresh_token".to_string());
                f.refresh_token = Some(minted.refresh_token.clone());
            })),
        )
        .await
        .unwrap_err();

        // THEN: single-use enforcement rejects it
        assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
        assert!(err.description.contains("already been used"));
    }

    // =========================================================================
    // Upstream error mapping
    // =========================================================================

    #[test]
    fn upstream_errors_map_to_oauth_codes() {
        let bad_code = Error::Upstream(
            "token endpoint returned bad_verification_code: expired".to_string(),
        );
        assert_eq!(map_upstream_error(bad_code).kind, OAuthErrorKind::InvalidGrant);

        let bad_creds = Error::Upstream(
            "token endpoint returned incorrect_client_credentials: nope".to_string(),
        );
        assert_eq!(map_upstream_error(bad_creds).kind, OAuthErrorKind::InvalidClient);

        let network = Error::Upstream("connection reset".to_string());
        assert_eq!(map_upstream_error(network).kind, OAuthErrorKind::ServerError);
    }
}
