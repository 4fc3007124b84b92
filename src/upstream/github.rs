//! GitHub upstream adapter.
//!
//! Quirks handled here:
//!
//! - GitHub's token endpoint answers `200 OK` even for invalid codes; the
//!   error is a field in the JSON body.
//! - GitHub access tokens do not expire unless the app opts into expiring
//!   tokens, in which case a `refresh_token` appears in the response.
//! - The organizations call is optional: if it fails, the `groups` claim is
//!   dropped rather than failing the whole identity fetch.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{
    ClientCredentials, Identity, ProviderKind, UpstreamProvider, UpstreamToken,
    build_http_client, parse_token_response,
};
use crate::{Error, Result};

const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const API_BASE: &str = "https://api.github.com";

/// GitHub adapter
pub struct GitHub {
    http: reqwest::Client,
}

impl GitHub {
    /// Create the adapter with a bounded request deadline.
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_http_client(timeout)?,
        })
    }

    async fn api_get(&self, path: &str, token: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .get(format!("{API_BASE}{path}"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Upstream(format!(
                "GitHub API {path} returned HTTP {status}"
            )));
        }

        Ok(response)
    }
}

/// Subset of the `/user` response we project claims from.
#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: u64,
    login: String,
    name: Option<String>,
    avatar_url: Option<String>,
    html_url: Option<String>,
    email: Option<String>,
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubOrg {
    id: u64,
}

impl From<GitHubUser> for Identity {
    fn from(user: GitHubUser) -> Self {
        let email_verified = user.email.as_ref().map(|_| true);
        Self {
            id: user.id.to_string(),
            username: user.login,
            name: user.name,
            avatar_url: user.avatar_url,
            profile_url: user.html_url,
            updated_at: user
                .updated_at
                .as_deref()
                .and_then(parse_github_timestamp),
            email: user.email,
            email_verified,
            groups: Vec::new(),
        }
    }
}

/// Parse GitHub's ISO 8601 timestamps into Unix time.
fn parse_github_timestamp(raw: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp())
}

#[async_trait]
impl UpstreamProvider for GitHub {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    fn authorize_endpoint(&self) -> &'static str {
        AUTHORIZE_URL
    }

    fn translate_scopes(&self, scopes: &[String]) -> String {
        let map = [
            ("profile", "profile"),
            ("email", "user:email"),
            ("groups", "read:org"),
        ];
        map.iter()
            .filter(|(oidc, _)| scopes.iter().any(|s| s == oidc))
            .map(|(_, github)| *github)
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn exchange_code(
        &self,
        credentials: ClientCredentials<'_>,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<UpstreamToken> {
        let mut form = HashMap::from([
            ("grant_type", "authorization_code"),
            ("client_id", credentials.id),
            ("client_secret", credentials.secret),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ]);
        if let Some(verifier) = code_verifier {
            form.insert("code_verifier", verifier);
        }

        let body: serde_json::Value = self
            .http
            .post(TOKEN_URL)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?
            .json()
            .await?;

        parse_token_response(body)
    }

    async fn refresh(
        &self,
        credentials: ClientCredentials<'_>,
        refresh_token: &str,
    ) -> Result<UpstreamToken> {
        let form = HashMap::from([
            ("grant_type", "refresh_token"),
            ("client_id", credentials.id),
            ("client_secret", credentials.secret),
            ("refresh_token", refresh_token),
        ]);

        let body: serde_json::Value = self
            .http
            .post(TOKEN_URL)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?
            .json()
            .await?;

        parse_token_response(body)
    }

    async fn fetch_identity(
        &self,
        token: &UpstreamToken,
        scopes: &[String],
    ) -> Result<Identity> {
        let user: GitHubUser = self
            .api_get("/user", &token.access_token)
            .await?
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("unexpected /user response: {e}")))?;

        let mut identity = Identity::from(user);

        if scopes.iter().any(|s| s == "groups") {
            match self.fetch_orgs(&token.access_token).await {
                Ok(groups) => identity.groups = groups,
                Err(e) => {
                    warn!(error = %e, "Organizations lookup failed, dropping groups claim");
                }
            }
        }

        Ok(identity)
    }
}

impl GitHub {
    async fn fetch_orgs(&self, token: &str) -> Result<Vec<String>> {
        let orgs: Vec<GitHubOrg> = self
            .api_get("/user/orgs", token)
            .await?
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("unexpected /user/orgs response: {e}")))?;

        Ok(orgs.into_iter().map(|org| org.id.to_string()).collect())
    }
}
