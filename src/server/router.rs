//! Router assembly and the small top-level handlers.

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{Html, IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::config::RootRedirect;

use super::context::{RequestContext, context_middleware};
use super::{AppState, authorize, token, userinfo, wellknown};

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let routes = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/docs", get(docs_handler))
        .route("/openapi.json", get(openapi_handler))
        .route("/authorize", get(authorize::authorize_handler))
        .route("/r", get(bare_redirect_handler))
        .route("/r/{*redirect_uri}", get(authorize::callback_handler))
        .route("/token", post(token::token_handler))
        .route(
            "/userinfo",
            get(userinfo::userinfo_handler).post(userinfo::userinfo_handler),
        )
        .route("/introspect", post(userinfo::introspect_handler))
        .route("/revoke", post(userinfo::revoke_handler))
        .route(
            "/.well-known/openid-configuration",
            get(wellknown::discovery_handler),
        )
        .route("/.well-known/jwks.json", get(wellknown::jwks_handler))
        .route("/.well-known/webfinger", get(wellknown::webfinger_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            context_middleware,
        ))
        .layer(TraceLayer::new_for_http());

    let router = if state.settings.base_path.is_empty() {
        routes
    } else {
        Router::new().nest(&state.settings.base_path, routes)
    };

    router.with_state(state)
}

/// `GET /health` — empty 200; depends on nothing, especially not upstream.
async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// `GET /` — redirect per `ROOT_REDIRECT`.
async fn root_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> axum::response::Response {
    let kind = state.provider.kind();
    match state.settings.root_redirect {
        RootRedirect::Repo => Redirect::temporary(kind.repo_url()).into_response(),
        RootRedirect::Settings => Redirect::temporary(kind.settings_url()).into_response(),
        RootRedirect::Docs => Redirect::temporary(&ctx.url_for("docs")).into_response(),
        RootRedirect::Off => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /r` — the bare callback endpoint is not a valid target.
async fn bare_redirect_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// `GET /docs` — minimal API reference page, gated by `ENABLE_DOCS`.
async fn docs_handler(State(state): State<Arc<AppState>>) -> axum::response::Response {
    if !state.settings.enable_docs {
        return StatusCode::NOT_FOUND.into_response();
    }

    let name = state.provider.kind().service_name();
    let page = format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>{name}</title></head>
<body>
<h1>{name}</h1>
<p>This service implements OpenID Connect 1.0. Start at
<a href="./.well-known/openid-configuration">the discovery document</a>
or fetch <a href="./openapi.json">openapi.json</a>.</p>
</body>
</html>
"#
    );
    Html(page).into_response()
}

/// `GET /openapi.json` — OpenAPI description of the public surface,
/// gated by `ENABLE_DOCS`.
async fn openapi_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> axum::response::Response {
    if !state.settings.enable_docs {
        return StatusCode::NOT_FOUND.into_response();
    }

    let kind = state.provider.kind();
    let doc = json!({
        "openapi": "3.1.0",
        "info": {
            "title": kind.service_name(),
            "version": env!("CARGO_PKG_VERSION"),
            "description": format!(
                "{} presents {} as an OpenID Connect 1.0 provider.",
                kind.service_name(),
                match kind {
                    crate::upstream::ProviderKind::Github => "GitHub",
                    crate::upstream::ProviderKind::Discord => "Discord",
                }
            ),
        },
        "servers": [{"url": ctx.base_url()}],
        "paths": {
            "/authorize": {"get": {"summary": "Authorization"}},
            "/r/{redirect_uri}": {"get": {"summary": "Callback"}},
            "/token": {"post": {"summary": "Token"}},
            "/userinfo": {
                "get": {"summary": "User Info"},
                "post": {"summary": "User Info"}
            },
            "/introspect": {"post": {"summary": "Introspection"}},
            "/revoke": {"post": {"summary": "Revocation"}},
            "/health": {"get": {"summary": "Healthcheck"}},
            "/.well-known/openid-configuration": {"get": {"summary": "Discovery"}},
            "/.well-known/jwks.json": {"get": {"summary": "JWKS"}},
            "/.well-known/webfinger": {"get": {"summary": "WebFinger"}}
        }
    });

    Json(doc).into_response()
}
