//! In-flight authorization state.
//!
//! Three `DashMap` indices, all in memory:
//!
//! - `transactions`: opaque `state_ref` → [`AuthorizationRequest`], created
//!   at `/authorize`, consumed exactly once by the upstream callback.
//! - `codes`: opaque code → [`AuthorizationCode`], created at the callback,
//!   consumed exactly once at `/token`.
//! - `consumed_refresh`: refresh-token JTIs that have been redeemed or
//!   revoked. Entries stay for the process lifetime — refresh tokens carry
//!   no expiry of their own, so this set is the only replay barrier.
//!
//! Transactions and codes carry their own expiry; consumption checks it and
//! a background reaper evicts whatever nobody ever consumed.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::debug;

use crate::flow::PkceMethod;

use super::generate_opaque;

/// An in-flight authorization, keyed by the opaque `state_ref` Takagi sends
/// upstream as the `state` parameter.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Relying party's client ID
    pub client_id: String,
    /// Granted OIDC scopes
    pub scopes: Vec<String>,
    /// The relying party's real destination
    pub rp_redirect_uri: String,
    /// The `/r/`-wrapped redirect URI sent to the upstream provider
    pub upstream_redirect_uri: String,
    /// Relying party's `state`, echoed back on the final redirect
    pub state: Option<String>,
    /// OIDC nonce to embed in the ID token
    pub nonce: Option<String>,
    /// PKCE challenge recorded at `/authorize`
    pub code_challenge: Option<String>,
    /// PKCE method for the recorded challenge
    pub code_challenge_method: Option<PkceMethod>,
    /// `Referer` that originated the request
    pub referer: Option<String>,
    /// Whether an upstream denial should bounce to the referer
    pub return_to_referrer: bool,
    /// Issuer URL observed at `/authorize`
    pub issuer: String,
    /// Unix time after which the transaction is dead
    pub expires_at: u64,
}

/// A Takagi-issued authorization code, keyed by its opaque value.
///
/// The upstream authorization code is exchanged at `/token`, not at the
/// callback: the upstream provider demands the client secret for the
/// exchange, and only the relying party holds it. Until then the upstream
/// code lives exclusively in this server-side record.
#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    /// The upstream provider's authorization code, not yet exchanged
    pub upstream_code: String,
    /// The `/r/`-wrapped redirect URI the upstream exchange must repeat
    pub upstream_redirect_uri: String,
    /// Client the code was issued to
    pub client_id: String,
    /// Redirect URI the code was delivered to
    pub rp_redirect_uri: String,
    /// Granted OIDC scopes
    pub scopes: Vec<String>,
    /// OIDC nonce carried through from the transaction
    pub nonce: Option<String>,
    /// PKCE challenge carried through from the transaction
    pub code_challenge: Option<String>,
    /// PKCE method for the recorded challenge
    pub code_challenge_method: Option<PkceMethod>,
    /// Unix time after which the code is dead
    pub expires_at: u64,
}

/// Unix time now, in seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// The in-memory stores backing the authorization flow.
pub struct FlowStores {
    transactions: DashMap<String, AuthorizationRequest>,
    codes: DashMap<String, AuthorizationCode>,
    consumed_refresh: DashMap<String, ()>,
    ttl: Duration,
}

impl FlowStores {
    /// Create empty stores with the given transaction/code TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            transactions: DashMap::new(),
            codes: DashMap::new(),
            consumed_refresh: DashMap::new(),
            ttl,
        }
    }

    /// The expiry a record created now should carry.
    #[must_use]
    pub fn expiry_from_now(&self) -> u64 {
        unix_now() + self.ttl.as_secs()
    }

    /// Store a transaction and return its opaque `state_ref`.
    pub fn insert_transaction(&self, request: AuthorizationRequest) -> String {
        let state_ref = generate_opaque();
        self.transactions.insert(state_ref.clone(), request);
        state_ref
    }

    /// Consume a transaction. Returns `None` for unknown, already-consumed,
    /// or expired references; the remove is atomic, so exactly one caller
    /// can ever receive the record.
    pub fn consume_transaction(&self, state_ref: &str) -> Option<AuthorizationRequest> {
        let (_, request) = self.transactions.remove(state_ref)?;
        if request.expires_at <= unix_now() {
            debug!("Discarded expired authorization transaction");
            return None;
        }
        Some(request)
    }

    /// Store an authorization code record and return the opaque code.
    pub fn insert_code(&self, code: AuthorizationCode) -> String {
        let value = generate_opaque();
        self.codes.insert(value.clone(), code);
        value
    }

    /// Consume an authorization code. Single-use: the first `/token`
    /// redemption wins, every later one gets `None` and maps to
    /// `invalid_grant`.
    pub fn consume_code(&self, code: &str) -> Option<AuthorizationCode> {
        let (_, record) = self.codes.remove(code)?;
        if record.expires_at <= unix_now() {
            debug!("Discarded expired authorization code");
            return None;
        }
        Some(record)
    }

    /// Mark a refresh-token JTI as consumed.
    ///
    /// Returns `true` the first time; `false` means the token was already
    /// redeemed or revoked and the caller must reject it.
    pub fn mark_refresh_consumed(&self, jti: &str) -> bool {
        self.consumed_refresh.insert(jti.to_string(), ()).is_none()
    }

    /// Remove expired transactions and codes. Called by the reaper.
    pub fn reap_expired(&self) -> usize {
        let now = unix_now();

        let dead_transactions: Vec<String> = self
            .transactions
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        let dead_codes: Vec<String> = self
            .codes
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();

        let count = dead_transactions.len() + dead_codes.len();
        for key in dead_transactions {
            self.transactions.remove(&key);
        }
        for key in dead_codes {
            self.codes.remove(&key);
        }
        count
    }
}

/// Spawn a background task that reaps expired flow state every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    stores: Arc<FlowStores>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = stores.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired authorization state");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Flow state reaper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_transaction(expires_at: u64) -> AuthorizationRequest {
        AuthorizationRequest {
            client_id: "client-1".to_string(),
            scopes: vec!["openid".to_string()],
            rp_redirect_uri: "https://app.example/cb".to_string(),
            upstream_redirect_uri: "https://takagi.example/r/https://app.example/cb"
                .to_string(),
            state: Some("rp-state".to_string()),
            nonce: None,
            code_challenge: None,
            code_challenge_method: None,
            referer: None,
            return_to_referrer: false,
            issuer: "https://takagi.example/".to_string(),
            expires_at,
        }
    }

    fn make_code(expires_at: u64) -> AuthorizationCode {
        AuthorizationCode {
            upstream_code: "gh-code".to_string(),
            upstream_redirect_uri: "https://takagi.example/r/https://app.example/cb"
                .to_string(),
            client_id: "client-1".to_string(),
            rp_redirect_uri: "https://app.example/cb".to_string(),
            scopes: vec!["openid".to_string()],
            nonce: None,
            code_challenge: None,
            code_challenge_method: None,
            expires_at,
        }
    }

    #[test]
    fn transaction_is_consumed_exactly_once() {
        // GIVEN: a stored transaction
        let stores = FlowStores::new(Duration::from_secs(600));
        let state_ref = stores.insert_transaction(make_transaction(unix_now() + 600));

        // WHEN: consumed twice
        let first = stores.consume_transaction(&state_ref);
        let second = stores.consume_transaction(&state_ref);

        // THEN: only the first succeeds
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn expired_transaction_is_not_returned() {
        let stores = FlowStores::new(Duration::from_secs(600));
        let state_ref = stores.insert_transaction(make_transaction(unix_now() - 1));

        assert!(stores.consume_transaction(&state_ref).is_none());
    }

    #[test]
    fn unknown_state_ref_returns_none() {
        let stores = FlowStores::new(Duration::from_secs(600));
        assert!(stores.consume_transaction("nope").is_none());
    }

    #[test]
    fn code_replay_returns_none() {
        let stores = FlowStores::new(Duration::from_secs(600));
        let code = stores.insert_code(make_code(unix_now() + 600));

        assert!(stores.consume_code(&code).is_some());
        assert!(stores.consume_code(&code).is_none());
    }

    #[test]
    fn expired_code_is_rejected() {
        let stores = FlowStores::new(Duration::from_secs(600));
        let code = stores.insert_code(make_code(unix_now() - 1));

        assert!(stores.consume_code(&code).is_none());
    }

    #[test]
    fn refresh_jti_is_single_use() {
        let stores = FlowStores::new(Duration::from_secs(600));

        assert!(stores.mark_refresh_consumed("jti-1"));
        assert!(!stores.mark_refresh_consumed("jti-1"));
        assert!(stores.mark_refresh_consumed("jti-2"));
    }

    #[test]
    fn reaper_removes_only_expired_entries() {
        let stores = FlowStores::new(Duration::from_secs(600));
        let live_ref = stores.insert_transaction(make_transaction(unix_now() + 600));
        stores.insert_transaction(make_transaction(unix_now() - 1));
        stores.insert_code(make_code(unix_now() - 1));

        let reaped = stores.reap_expired();

        assert_eq!(reaped, 2);
        assert!(stores.consume_transaction(&live_ref).is_some());
    }

    #[test]
    fn distinct_inserts_get_distinct_references() {
        let stores = FlowStores::new(Duration::from_secs(600));
        let a = stores.insert_transaction(make_transaction(unix_now() + 600));
        let b = stores.insert_transaction(make_transaction(unix_now() + 600));
        assert_ne!(a, b);
    }
}
