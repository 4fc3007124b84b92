//! Discord upstream adapter (Snowflake mode).
//!
//! Quirks handled here:
//!
//! - Discord rejects authorization requests that carry no scope at all, so
//!   the minimal `identify` scope is always requested even when the relying
//!   party asked only for `openid`. Relying parties never see this.
//! - Avatars are content hashes; the CDN URL is assembled locally.
//! - Discord has no profile-update timestamp, so `updated_at` is omitted.

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

const AUTHORIZE_URL: &str = "https://discord.com/oauth2/authorize";
const TOKEN_URL: &str = "https://discord.com/api/v10/oauth2/token";
const API_BASE: &str = "https://discord.com/api/v10";
const CDN_BASE: &str = "https://cdn.discordapp.com";

/// Discord adapter
pub struct Discord {
    http: reqwest::Client,
}

impl Discord {
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
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Upstream(format!(
                "Discord API {path} returned HTTP {status}"
            )));
        }

        Ok(response)
    }

    async fn fetch_guilds(&self, token: &str) -> Result<Vec<String>> {
        let guilds: Vec<DiscordGuild> = self
            .api_get("/users/@me/guilds", token)
            .await?
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("unexpected guilds response: {e}")))?;

        Ok(guilds.into_iter().map(|g| g.id).collect())
    }
}

/// Subset of the `/users/@me` response we project claims from.
#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
    global_name: Option<String>,
    avatar: Option<String>,
    email: Option<String>,
    verified: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DiscordGuild {
    id: String,
}

impl From<DiscordUser> for Identity {
    fn from(user: DiscordUser) -> Self {
        let avatar_url = user
            .avatar
            .as_deref()
            .map(|hash| format!("{CDN_BASE}/avatars/{}/{hash}.png", user.id));
        let profile_url = Some(format!("https://discord.com/users/{}", user.id));
        let email_verified = user.email.as_ref().and(user.verified);

        Self {
            id: user.id,
            username: user.username,
            name: user.global_name,
            avatar_url,
            profile_url,
            updated_at: None,
            email: user.email,
            email_verified,
            groups: Vec::new(),
        }
    }
}

#[async_trait]
impl UpstreamProvider for Discord {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Discord
    }

    fn authorize_endpoint(&self) -> &'static str {
        AUTHORIZE_URL
    }

    fn translate_scopes(&self, scopes: &[String]) -> String {
        // `identify` is unconditional; an empty scope list is an upstream
        // error ("no scopes provided").
        let mut discord_scopes = vec!["identify"];
        if scopes.iter().any(|s| s == "email") {
            discord_scopes.push("email");
        }
        if scopes.iter().any(|s| s == "groups") {
            discord_scopes.push("guilds");
        }
        discord_scopes.join(" ")
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

        let response = self.http.post(TOKEN_URL).form(&form).send().await?;
        let body: serde_json::Value = response.json().await?;
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

        let response = self.http.post(TOKEN_URL).form(&form).send().await?;
        let body: serde_json::Value = response.json().await?;
        parse_token_response(body)
    }

    async fn fetch_identity(
        &self,
        token: &UpstreamToken,
        scopes: &[String],
    ) -> Result<Identity> {
        let user: DiscordUser = self
            .api_get("/users/@me", &token.access_token)
            .await?
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("unexpected /users/@me response: {e}")))?;

        let mut identity = Identity::from(user);

        if scopes.iter().any(|s| s == "groups") {
            match self.fetch_guilds(&token.access_token).await {
                Ok(groups) => identity.groups = groups,
                Err(e) => {
                    warn!(error = %e, "Guild lookup failed, dropping groups claim");
                }
            }
        }

        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn openid_only_still_requests_identify() {
        // Discord refuses an empty scope string; `identify` fills the gap
        // without the relying party ever seeing it.
        let discord = Discord::new(Duration::from_secs(1)).unwrap();
        assert_eq!(discord.translate_scopes(&scopes(&["openid"])), "identify");
    }

    #[test]
    fn scope_translation_adds_email_and_guilds() {
        let discord = Discord::new(Duration::from_secs(1)).unwrap();
        assert_eq!(
            discord.translate_scopes(&scopes(&["openid", "email", "groups"])),
            "identify email guilds"
        );
        // `profile` needs nothing beyond identify.
        assert_eq!(
            discord.translate_scopes(&scopes(&["openid", "profile"])),
            "identify"
        );
    }

    #[test]
    fn user_response_maps_to_identity() {
        let user: DiscordUser = serde_json::from_str(
            r#"{
                "id": "80351110224678912",
                "username": "nelly",
                "global_name": "Nelly",
                "avatar": "8342729096ea3675442027381ff50dfe",
                "email": "nelly@discord.com",
                "verified": true
            }"#,
        )
        .unwrap();

        let identity = Identity::from(user);
        assert_eq!(identity.id, "80351110224678912");
        assert_eq!(identity.username, "nelly");
        assert_eq!(identity.name.as_deref(), Some("Nelly"));
        assert_eq!(
            identity.avatar_url.as_deref(),
            Some(
                "https://cdn.discordapp.com/avatars/80351110224678912/8342729096ea3675442027381ff50dfe.png"
            )
        );
        assert_eq!(identity.email_verified, Some(true));
        assert!(identity.updated_at.is_none());
    }

    #[test]
    fn user_without_avatar_or_email_omits_claims() {
        let user: DiscordUser = serde_json::from_str(
            r#"{"id": "1", "username": "ghost", "global_name": null,
                "avatar": null, "email": null, "verified": null}"#,
        )
        .unwrap();

        let identity = Identity::from(user);
        assert!(identity.avatar_url.is_none());
        assert!(identity.email.is_none());
        assert!(identity.email_verified.is_none());
    }
}
