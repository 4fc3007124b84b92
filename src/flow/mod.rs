//! Authorization flow engine.
//!
//! The flow is driven by two short-lived, single-use records: the
//! *transaction* created at `/authorize` and consumed at the upstream
//! callback, and the *authorization code* created at the callback and
//! consumed at `/token`. Both live in [`store::FlowStores`]; consumption is
//! an atomic remove, so exactly one of any two racing redemptions wins.
//!
//! PKCE verification lives here too: `/token` accepts a code with a recorded
//! challenge iff the presented verifier matches under the recorded method
//! (RFC 7636).

pub mod store;

pub use store::{AuthorizationCode, AuthorizationRequest, FlowStores, spawn_reaper};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// PKCE code challenge methods supported at `/authorize`.
///
/// `plain` is accepted for compatibility; `S256` is what discovery
/// advertises and clients should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PkceMethod {
    /// `challenge = base64url(SHA-256(verifier))`
    S256,
    /// `challenge = verifier`
    Plain,
}

impl PkceMethod {
    /// Parse the `code_challenge_method` request parameter.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "S256" => Some(Self::S256),
            "plain" => Some(Self::Plain),
            _ => None,
        }
    }

    /// Wire name of the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S256 => "S256",
            Self::Plain => "plain",
        }
    }
}

/// Verify a PKCE code verifier against the recorded challenge.
///
/// Comparison is constant-time in both branches.
#[must_use]
pub fn verify_pkce(method: PkceMethod, challenge: &str, verifier: &str) -> bool {
    match method {
        PkceMethod::S256 => {
            let computed = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
            computed.as_bytes().ct_eq(challenge.as_bytes()).into()
        }
        PkceMethod::Plain => verifier.as_bytes().ct_eq(challenge.as_bytes()).into(),
    }
}

/// Generate an opaque reference (state refs, authorization codes): 256 bits
/// of OS randomness, base64url.
#[must_use]
pub fn generate_opaque() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_method_parses_wire_names() {
        assert_eq!(PkceMethod::parse("S256"), Some(PkceMethod::S256));
        assert_eq!(PkceMethod::parse("plain"), Some(PkceMethod::Plain));
        assert_eq!(PkceMethod::parse("s256"), None);
        assert_eq!(PkceMethod::parse("SHA256"), None);
    }

    #[test]
    fn s256_verifier_matches_its_challenge() {
        // GIVEN: the RFC 7636 appendix B test vector
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

        // THEN: the verifier matches and a wrong one does not
        assert!(verify_pkce(PkceMethod::S256, challenge, verifier));
        assert!(!verify_pkce(PkceMethod::S256, challenge, "wrong-verifier"));
    }

    #[test]
    fn plain_compares_literally() {
        assert!(verify_pkce(PkceMethod::Plain, "abc123", "abc123"));
        assert!(!verify_pkce(PkceMethod::Plain, "abc123", "abc124"));
    }

    #[test]
    fn opaque_references_are_unique_and_urlsafe() {
        let a = generate_opaque();
        let b = generate_opaque();
        assert_ne!(a, b);
        assert!(a.len() >= 43);
        assert!(!a.contains('+'));
        assert!(!a.contains('/'));
        assert!(!a.contains('='));
    }
}
