//! Upstream identity providers.
//!
//! GitHub and Discord are variants of one capability set: exchange an
//! authorization code, refresh a token, fetch the user's identity. The flow
//! engine is identical across them; everything provider-specific (endpoint
//! URLs, scope translation, identity shapes, API quirks) lives behind
//! [`UpstreamProvider`].

pub mod discord;
pub mod github;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which upstream provider this deployment fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// GitHub (Takagi)
    Github,
    /// Discord (Snowflake)
    Discord,
}

impl ProviderKind {
    /// Environment-variable prefix for this provider's settings.
    #[must_use]
    pub fn env_prefix(self) -> &'static str {
        match self {
            Self::Github => "TAKAGI_",
            Self::Discord => "SNOWFLAKE_",
        }
    }

    /// Service name as shown in logs and documentation.
    #[must_use]
    pub fn service_name(self) -> &'static str {
        match self {
            Self::Github => "Takagi",
            Self::Discord => "Snowflake",
        }
    }

    /// Project page for `ROOT_REDIRECT=repo`.
    #[must_use]
    pub fn repo_url(self) -> &'static str {
        match self {
            Self::Github => "https://github.com/celsiusnarhwal/takagi",
            Self::Discord => "https://github.com/celsiusnarhwal/snowflake",
        }
    }

    /// Application settings page for `ROOT_REDIRECT=settings`.
    #[must_use]
    pub fn settings_url(self) -> &'static str {
        match self {
            Self::Github => "https://github.com/settings",
            Self::Discord => "https://discord.com/developers/applications",
        }
    }
}

/// An OAuth2 token as returned by the upstream provider.
///
/// The whole structure is sealed into locally issued tokens so a later
/// `/userinfo` or refresh can reach upstream again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamToken {
    /// Upstream access token
    pub access_token: String,
    /// Token type (usually "bearer")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Upstream refresh token, when the provider issues one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the upstream token expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Scopes the provider actually granted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Normalized identity snapshot, independent of the provider.
///
/// Optional fields that the provider did not supply stay `None` and are
/// omitted from tokens and `/userinfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Stable upstream user ID (always stringified)
    pub id: String,
    /// Login / handle
    pub username: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Avatar image URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Public profile URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    /// Unix time of the last profile update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    /// Primary email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Whether the email address is verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    /// Group memberships (organization / guild IDs)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// Client credentials the relying party presented at `/token`.
///
/// Takagi holds no client secrets of its own; the upstream provider is the
/// authority that accepts or rejects them.
#[derive(Debug, Clone, Copy)]
pub struct ClientCredentials<'a> {
    /// OAuth2 client ID (the upstream application's)
    pub id: &'a str,
    /// OAuth2 client secret
    pub secret: &'a str,
}

/// The capability set every upstream provider implements.
#[async_trait]
pub trait UpstreamProvider: Send + Sync + 'static {
    /// Which provider this is.
    fn kind(&self) -> ProviderKind;

    /// The provider's authorization endpoint.
    fn authorize_endpoint(&self) -> &'static str;

    /// Translate OIDC scopes into the provider's scope string.
    fn translate_scopes(&self, scopes: &[String]) -> String;

    /// Exchange an upstream authorization code for an upstream token.
    ///
    /// `code_verifier` is forwarded when the relying party used PKCE.
    async fn exchange_code(
        &self,
        credentials: ClientCredentials<'_>,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<UpstreamToken>;

    /// Exchange an upstream refresh token for a fresh upstream token.
    async fn refresh(
        &self,
        credentials: ClientCredentials<'_>,
        refresh_token: &str,
    ) -> Result<UpstreamToken>;

    /// Fetch a fresh identity snapshot for the granted scopes.
    ///
    /// Failures in non-mandatory subcalls (organizations, guilds) drop the
    /// affected claims instead of failing the whole request.
    async fn fetch_identity(
        &self,
        token: &UpstreamToken,
        scopes: &[String],
    ) -> Result<Identity>;
}

/// Construct the provider adapter for `kind`.
pub fn create(kind: ProviderKind, timeout: Duration) -> Result<Arc<dyn UpstreamProvider>> {
    Ok(match kind {
        ProviderKind::Github => Arc::new(github::GitHub::new(timeout)?),
        ProviderKind::Discord => Arc::new(discord::Discord::new(timeout)?),
    })
}

/// Interpret a token-endpoint response body.
///
/// GitHub reports errors as a 200 with an `error` field in the body, so the
/// field check has to come before deserialization regardless of status.
pub(crate) fn parse_token_response(value: serde_json::Value) -> Result<UpstreamToken> {
    if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
        let description = value
            .get("error_description")
            .and_then(|d| d.as_str())
            .unwrap_or("no description");
        return Err(Error::Upstream(format!(
            "token endpoint returned {error}: {description}"
        )));
    }

    serde_json::from_value(value)
        .map_err(|e| Error::Upstream(format!("unexpected token response shape: {e}")))
}

/// Shared reqwest client construction for upstream calls.
pub(crate) fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("takagi/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provider_kind_selects_prefix_and_name() {
        assert_eq!(ProviderKind::Github.env_prefix(), "TAKAGI_");
        assert_eq!(ProviderKind::Discord.env_prefix(), "SNOWFLAKE_");
        assert_eq!(ProviderKind::Github.service_name(), "Takagi");
        assert_eq!(ProviderKind::Discord.service_name(), "Snowflake");
    }

    #[test]
    fn token_response_parses_success() {
        let token = parse_token_response(json!({
            "access_token": "gho_abc",
            "token_type": "bearer",
            "scope": "read:org"
        }))
        .unwrap();

        assert_eq!(token.access_token, "gho_abc");
        assert_eq!(token.scope.as_deref(), Some("read:org"));
        assert!(token.refresh_token.is_none());
    }

    #[test]
    fn token_response_surfaces_in_body_errors() {
        // GitHub returns HTTP 200 for bad codes; the error lives in the body.
        let err = parse_token_response(json!({
            "error": "bad_verification_code",
            "error_description": "The code passed is incorrect or expired."
        }))
        .unwrap_err();

        assert!(err.to_string().contains("bad_verification_code"));
    }

    #[test]
    fn token_response_rejects_missing_access_token() {
        assert!(parse_token_response(json!({"token_type": "bearer"})).is_err());
    }

    #[test]
    fn upstream_token_roundtrips_compactly() {
        // Sealed tokens should not carry nulls for absent fields.
        let token = UpstreamToken {
            access_token: "gho_abc".to_string(),
            token_type: None,
            refresh_token: None,
            expires_in: None,
            scope: None,
        };
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, r#"{"access_token":"gho_abc"}"#);
    }
}
