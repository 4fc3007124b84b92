//! Token minting and verification.
//!
//! All locally issued tokens are RS256 JWS signed by the active keyset, with
//! the signing `kid` in the header:
//!
//! - *ID tokens* carry the identity claims gated by the granted scopes and
//!   are audienced to the relying party's client ID.
//! - *Access tokens* are audienced to the observed `/userinfo` URL and carry
//!   the upstream OAuth2 token as a compact JWE in the `token` claim; they
//!   are opaque to relying parties.
//! - *Refresh tokens* are audienced to the issuing client, carry a `jti` for
//!   single-use enforcement, and seal the upstream token so the pair can be
//!   re-minted.
//!
//! Verification pins the issuer to the URL observed on the current request
//! and rejects unknown `kid`s, so a keyset rotation invalidates everything
//! at once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::keyset::{Keyset, KeysetManager};
use crate::upstream::{Identity, UpstreamToken};
use crate::{Error, Result};

/// Unix timestamp of 9999-12-31T23:59:59Z, the stand-in expiry for tokens
/// that effectively never expire.
pub const MAX_TIMESTAMP: i64 = 253_402_300_799;

/// Claims of a Takagi access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Issuer (observed base URL)
    pub iss: String,
    /// Upstream user ID
    pub sub: String,
    /// The observed `/userinfo` URL
    pub aud: String,
    /// Issued at
    pub iat: i64,
    /// Expires at
    pub exp: i64,
    /// Space-separated granted scopes
    pub scope: String,
    /// Upstream OAuth2 token, JWE-encrypted
    pub token: String,
}

/// Claims of a Takagi refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    /// Issuer (observed base URL)
    pub iss: String,
    /// Upstream user ID
    pub sub: String,
    /// The client the token is bound to
    pub aud: String,
    /// Issued at
    pub iat: i64,
    /// Expires at
    pub exp: i64,
    /// Single-use token identifier
    pub jti: String,
    /// Space-separated granted scopes
    pub scope: String,
    /// Upstream OAuth2 token, JWE-encrypted
    pub token: String,
}

/// The freshly minted token triple.
#[derive(Debug)]
pub struct TokenSet {
    /// RS256 JWS access token
    pub access_token: String,
    /// RS256 JWS ID token
    pub id_token: String,
    /// RS256 JWS refresh token
    pub refresh_token: String,
    /// Seconds until expiry; `None` for effectively non-expiring tokens
    pub expires_in: Option<u64>,
}

/// Everything needed to mint a token set.
#[derive(Debug)]
pub struct MintRequest<'a> {
    /// Identity snapshot fetched from the upstream provider
    pub identity: &'a Identity,
    /// The upstream OAuth2 token to seal into the access/refresh tokens
    pub upstream_token: &'a UpstreamToken,
    /// Relying-party client ID (ID token audience, refresh binding)
    pub client_id: &'a str,
    /// Granted scopes
    pub scopes: &'a [String],
    /// Nonce echoed into the ID token
    pub nonce: Option<&'a str>,
    /// Observed issuer URL
    pub issuer: &'a str,
    /// Observed `/userinfo` URL (access token audience)
    pub userinfo_url: &'a str,
}

/// Why an access token was rejected.
#[derive(Debug, thiserror::Error)]
pub enum AccessTokenError {
    /// The bearer verified as one of our JWS but is an ID token, which must
    /// never be accepted as a credential.
    #[error("an ID token cannot be used as an access token")]
    NotAnAccessToken,
    /// Signature, expiry, issuer, audience, or `kid` check failed.
    #[error("access token verification failed")]
    Invalid,
}

/// Mints and verifies all locally issued tokens.
pub struct TokenService {
    keys: Arc<KeysetManager>,
    lifetime: Option<Duration>,
}

impl TokenService {
    /// Create the service over the shared keyset.
    #[must_use]
    pub fn new(keys: Arc<KeysetManager>, lifetime: Option<Duration>) -> Self {
        Self { keys, lifetime }
    }

    fn expiry(&self, now: i64) -> i64 {
        match self.lifetime {
            Some(lifetime) => now + lifetime.as_secs() as i64,
            None => MAX_TIMESTAMP,
        }
    }

    /// Mint an access + ID + refresh token set.
    ///
    /// `now` is the Unix timestamp of the `/token` request; `iat` is always
    /// `now` and `exp` is `now + lifetime` (or the maximum representable
    /// timestamp when no lifetime is configured).
    pub fn mint(&self, request: &MintRequest<'_>, now: i64) -> Result<TokenSet> {
        let keyset = self.keys.current();
        let exp = self.expiry(now);
        let scope = request.scopes.join(" ");

        let sealed_upstream =
            keyset.encrypt(serde_json::to_string(request.upstream_token)?.as_bytes())?;

        let mut id_claims = BTreeMap::new();
        id_claims.insert("iss".to_string(), Value::from(request.issuer));
        id_claims.insert("sub".to_string(), Value::from(request.identity.id.as_str()));
        id_claims.insert("aud".to_string(), Value::from(request.client_id));
        id_claims.insert("iat".to_string(), Value::from(now));
        id_claims.insert("exp".to_string(), Value::from(exp));
        if let Some(nonce) = request.nonce {
            id_claims.insert("nonce".to_string(), Value::from(nonce));
        }
        for (claim, value) in project_claims(request.identity, request.scopes) {
            id_claims.insert(claim, value);
        }
        let id_token = self.sign(&keyset, &id_claims)?;

        let access_claims = AccessClaims {
            iss: request.issuer.to_string(),
            sub: request.identity.id.clone(),
            aud: request.userinfo_url.to_string(),
            iat: now,
            exp,
            scope: scope.clone(),
            token: sealed_upstream.clone(),
        };
        let access_token = self.sign(&keyset, &access_claims)?;

        // Refresh tokens do not expire on their own; they die with keyset
        // rotation or single-use redemption.
        let refresh_claims = RefreshClaims {
            iss: request.issuer.to_string(),
            sub: request.identity.id.clone(),
            aud: request.client_id.to_string(),
            iat: now,
            exp: MAX_TIMESTAMP,
            jti: Uuid::new_v4().to_string(),
            scope,
            token: sealed_upstream,
        };
        let refresh_token = self.sign(&keyset, &refresh_claims)?;

        Ok(TokenSet {
            access_token,
            id_token,
            refresh_token,
            expires_in: self.lifetime.map(|l| l.as_secs()),
        })
    }

    fn sign<T: Serialize>(&self, keyset: &Keyset, claims: &T) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(keyset.signing_kid().to_string());
        Ok(jsonwebtoken::encode(&header, claims, keyset.encoding_key())?)
    }

    /// Verify a bearer access token for `/userinfo` or `/introspect`.
    ///
    /// The `aud` claim must equal the observed `/userinfo` URL and `iss` the
    /// observed issuer. A structurally valid JWS without a `token` claim is
    /// an ID token presented as a credential and is reported separately.
    pub fn verify_access(
        &self,
        token: &str,
        issuer: &str,
        userinfo_url: &str,
    ) -> std::result::Result<AccessClaims, AccessTokenError> {
        let keyset = self.keys.current();
        self.check_kid(&keyset, token)
            .map_err(|_| AccessTokenError::Invalid)?;

        // First pass: signature + exp + iss only, so an ID token (different
        // audience, no `token` claim) can be told apart from garbage.
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.validate_aud = false;
        let data =
            jsonwebtoken::decode::<Value>(token, keyset.decoding_key(), &validation)
                .map_err(|_| AccessTokenError::Invalid)?;

        if data.claims.get("token").is_none() {
            return Err(AccessTokenError::NotAnAccessToken);
        }

        let claims: AccessClaims =
            serde_json::from_value(data.claims).map_err(|_| AccessTokenError::Invalid)?;
        if claims.aud != userinfo_url {
            return Err(AccessTokenError::Invalid);
        }

        Ok(claims)
    }

    /// Verify a refresh token presented by `client_id`.
    ///
    /// Refresh tokens are bound to the client they were issued to; any other
    /// client gets a verification failure indistinguishable from an invalid
    /// token.
    pub fn verify_refresh(
        &self,
        token: &str,
        issuer: &str,
        client_id: &str,
    ) -> Result<RefreshClaims> {
        let keyset = self.keys.current();
        self.check_kid(&keyset, token)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[client_id]);
        let data =
            jsonwebtoken::decode::<RefreshClaims>(token, keyset.decoding_key(), &validation)?;

        Ok(data.claims)
    }

    /// Decode a refresh token for revocation.
    ///
    /// Signature, expiry, issuer, and shape are checked, but the audience is
    /// not pinned: revocation only needs proof that the caller holds the
    /// token, not that it authenticates as the issuing client.
    pub fn decode_refresh(&self, token: &str, issuer: &str) -> Result<RefreshClaims> {
        let keyset = self.keys.current();
        self.check_kid(&keyset, token)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.validate_aud = false;
        let data =
            jsonwebtoken::decode::<RefreshClaims>(token, keyset.decoding_key(), &validation)?;

        Ok(data.claims)
    }

    /// Decrypt the sealed upstream token out of verified claims.
    pub fn unseal_upstream(&self, sealed: &str) -> Result<UpstreamToken> {
        let keyset = self.keys.current();
        let plaintext = keyset.decrypt(sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn check_kid(&self, keyset: &Keyset, token: &str) -> Result<()> {
        let header = jsonwebtoken::decode_header(token)?;
        match header.kid.as_deref() {
            Some(kid) if kid == keyset.signing_kid() => Ok(()),
            _ => Err(Error::Keyset("unknown signing kid".to_string())),
        }
    }
}

/// Project the identity snapshot onto the granted scopes.
///
/// A claim appears iff its gating scope was granted *and* the underlying
/// value is present; null claims are omitted entirely, both here and in
/// `/userinfo`.
#[must_use]
pub fn project_claims(identity: &Identity, scopes: &[String]) -> BTreeMap<String, Value> {
    let granted = |s: &str| scopes.iter().any(|scope| scope == s);
    let mut claims = BTreeMap::new();

    if granted("profile") {
        claims.insert(
            "preferred_username".to_string(),
            Value::from(identity.username.as_str()),
        );
        if let Some(name) = &identity.name {
            claims.insert("name".to_string(), Value::from(name.as_str()));
            claims.insert("nickname".to_string(), Value::from(name.as_str()));
        }
        if let Some(picture) = &identity.avatar_url {
            claims.insert("picture".to_string(), Value::from(picture.as_str()));
        }
        if let Some(profile) = &identity.profile_url {
            claims.insert("profile".to_string(), Value::from(profile.as_str()));
        }
        if let Some(updated_at) = identity.updated_at {
            claims.insert("updated_at".to_string(), Value::from(updated_at));
        }
    }

    if granted("email") {
        if let Some(email) = &identity.email {
            claims.insert("email".to_string(), Value::from(email.as_str()));
            claims.insert(
                "email_verified".to_string(),
                Value::from(identity.email_verified.unwrap_or(false)),
            );
        }
    }

    if granted("groups") && !identity.groups.is_empty() {
        claims.insert(
            "groups".to_string(),
            Value::from(identity.groups.clone()),
        );
    }

    claims
}

/// Split a space-separated scope string into a list.
#[must_use]
pub fn parse_scopes(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(str::to_string).collect()
}
