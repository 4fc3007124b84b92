//! The `/.well-known/` surface: discovery, JWKS, WebFinger.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::policy;

use super::AppState;
use super::context::RequestContext;

/// The `rel` value that selects the OIDC issuer link in WebFinger.
const ISSUER_REL: &str = "http://openid.net/specs/connect/1.0/issuer";

/// `GET /.well-known/openid-configuration`
///
/// Every URL is derived from the observed scheme, host, and base path —
/// nothing is baked in.
pub(super) async fn discovery_handler(
    Extension(ctx): Extension<RequestContext>,
) -> Json<Value> {
    Json(json!({
        "issuer": ctx.base_url(),
        "authorization_endpoint": ctx.url_for("authorize"),
        "token_endpoint": ctx.url_for("token"),
        "userinfo_endpoint": ctx.userinfo_url(),
        "revocation_endpoint": ctx.url_for("revoke"),
        "introspection_endpoint": ctx.url_for("introspect"),
        "jwks_uri": ctx.url_for(".well-known/jwks.json"),
        "claims_supported": [
            "sub",
            "preferred_username",
            "name",
            "nickname",
            "picture",
            "profile",
            "updated_at",
            "email",
            "email_verified",
            "groups",
        ],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "token_endpoint_auth_methods_supported": [
            "client_secret_basic",
            "client_secret_post",
        ],
        "response_types_supported": ["code"],
        "subject_types_supported": ["public"],
        "scopes_supported": ["openid", "profile", "email", "groups"],
        "code_challenge_methods_supported": ["S256", "plain"],
    }))
}

/// `GET /.well-known/jwks.json` — public parameters of the signing key
/// only; the encryption key is never published.
pub(super) async fn jwks_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let jwks = state.keys.current().public_jwks();
    Json(serde_json::to_value(jwks).unwrap_or_else(|_| json!({"keys": []})))
}

/// Query parameters of `GET /.well-known/webfinger`.
#[derive(Debug, Deserialize)]
pub(super) struct WebFingerParams {
    resource: Option<String>,
    rel: Option<String>,
}

fn not_found(detail: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": detail }))).into_response()
}

/// `GET /.well-known/webfinger`
///
/// Only `acct:<email>` resources whose domain passes the WebFinger
/// allowlist exist on this server; everything else is a 404. The `links`
/// array carries the issuer entry unless `rel` asks for something else.
pub(super) async fn webfinger_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Query(params): Query<WebFingerParams>,
) -> Response {
    let Some(resource) = params.resource.as_deref() else {
        return not_found("A resource query parameter is required".to_string());
    };

    let Some((_, domain)) = policy::parse_acct_resource(resource) else {
        return not_found(format!(
            "The resource {resource} does not exist on this server"
        ));
    };

    if !policy::webfinger_host_allowed(&state.settings.allowed_webfinger_hosts, domain) {
        return not_found(format!(
            "The resource {resource} does not exist on this server"
        ));
    }

    let mut links = Vec::new();
    let rel = params.rel.as_deref().unwrap_or(ISSUER_REL);
    if rel == ISSUER_REL {
        links.push(json!({ "rel": ISSUER_REL, "href": ctx.base_url() }));
    }

    Json(json!({ "subject": resource, "links": links })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::{request_context, test_state};
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    #[tokio::test]
    async fn discovery_derives_urls_from_the_request() {
        let ctx = request_context("https", "takagi.example");
        let Json(doc) = discovery_handler(Extension(ctx)).await;

        assert_eq!(doc["issuer"], "https://takagi.example/");
        assert_eq!(doc["authorization_endpoint"], "https://takagi.example/authorize");
        assert_eq!(doc["token_endpoint"], "https://takagi.example/token");
        assert_eq!(doc["userinfo_endpoint"], "https://takagi.example/userinfo");
        assert_eq!(doc["jwks_uri"], "https://takagi.example/.well-known/jwks.json");
        assert_eq!(doc["response_types_supported"], json!(["code"]));
        assert_eq!(doc["subject_types_supported"], json!(["public"]));
        assert_eq!(doc["id_token_signing_alg_values_supported"], json!(["RS256"]));
        assert_eq!(
            doc["token_endpoint_auth_methods_supported"],
            json!(["client_secret_basic", "client_secret_post"])
        );
    }

    #[tokio::test]
    async fn discovery_follows_the_observed_host_and_port() {
        let ctx = request_context("http", "localhost:8000");
        let Json(doc) = discovery_handler(Extension(ctx)).await;

        assert_eq!(doc["issuer"], "http://localhost:8000/");
        assert_eq!(doc["token_endpoint"], "http://localhost:8000/token");
    }

    // =========================================================================
    // JWKS
    // =========================================================================

    #[tokio::test]
    async fn jwks_exposes_only_public_signing_material() {
        let state = test_state(|_| {});
        let Json(doc) = jwks_handler(State(state)).await;

        let keys = doc["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0]["kty"], "RSA");
        assert_eq!(keys[0]["use"], "sig");
        assert_eq!(keys[0]["alg"], "RS256");
        assert!(keys[0].get("n").is_some());
        assert!(keys[0].get("d").is_none());
        assert!(keys[0].get("k").is_none());
    }

    // =========================================================================
    // WebFinger
    // =========================================================================

    fn webfinger_state() -> Arc<super::super::AppState> {
        test_state(|s| {
            s.allowed_webfinger_hosts =
                vec!["allowed.example".to_string(), "*.kitauji.ed.jp".to_string()];
        })
    }

    #[tokio::test]
    async fn allowed_domain_gets_one_issuer_link() {
        let response = webfinger_handler(
            State(webfinger_state()),
            Extension(request_context("https", "takagi.example")),
            Query(WebFingerParams {
                resource: Some("acct:alice@allowed.example".to_string()),
                rel: None,
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["subject"], "acct:alice@allowed.example");
        let links = body["links"].as_array().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0]["rel"], ISSUER_REL);
        assert_eq!(links[0]["href"], "https://takagi.example/");
    }

    #[tokio::test]
    async fn other_rel_values_empty_the_links() {
        let response = webfinger_handler(
            State(webfinger_state()),
            Extension(request_context("https", "takagi.example")),
            Query(WebFingerParams {
                resource: Some("acct:alice@allowed.example".to_string()),
                rel: Some("http://webfinger.net/rel/avatar".to_string()),
            }),
        )
        .await;

        let body = body_json(response).await;
        assert_eq!(body["links"], json!([]));
    }

    #[tokio::test]
    async fn disallowed_domain_is_404() {
        let response = webfinger_handler(
            State(webfinger_state()),
            Extension(request_context("https", "takagi.example")),
            Query(WebFingerParams {
                resource: Some("acct:alice@other.example".to_string()),
                rel: None,
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wildcard_webfinger_domains_match_subdomains() {
        let response = webfinger_handler(
            State(webfinger_state()),
            Extension(request_context("https", "takagi.example")),
            Query(WebFingerParams {
                resource: Some("acct:koumae@mail.kitauji.ed.jp".to_string()),
                rel: None,
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn non_acct_resources_are_404() {
        for resource in ["https://foo", "acct:not-an-email", "mailto:a@b.example"] {
            let response = webfinger_handler(
                State(webfinger_state()),
                Extension(request_context("https", "takagi.example")),
                Query(WebFingerParams {
                    resource: Some(resource.to_string()),
                    rel: None,
                }),
            )
            .await;

            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{resource}");
        }
    }

    #[tokio::test]
    async fn missing_resource_is_404() {
        let response = webfinger_handler(
            State(webfinger_state()),
            Extension(request_context("https", "takagi.example")),
            Query(WebFingerParams {
                resource: None,
                rel: None,
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
