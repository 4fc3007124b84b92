//! JSON Web Key types.
//!
//! Takagi keysets hold exactly two keys: an RSA signing key (`use=sig`,
//! `alg=RS256`) with full private parameters and a 256-bit octet-sequence
//! encryption key (`use=enc`, `alg=A256GCM`). Key IDs are RFC 7638
//! thumbprints computed at generation time.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::BigUint;
use rsa::RsaPrivateKey;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// RSA modulus size for generated signing keys.
const RSA_BITS: usize = 2048;

/// Size of the octet-sequence encryption key in bytes (A256GCM).
const OCT_BYTES: usize = 32;

/// A single JSON Web Key, discriminated by `kty`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    /// RSA key (signing)
    #[serde(rename = "RSA")]
    Rsa(RsaJwk),
    /// Octet sequence key (encryption)
    #[serde(rename = "oct")]
    Oct(OctJwk),
}

/// RSA JWK with optional private parameters.
///
/// All big integers are base64url-encoded big-endian byte strings per
/// RFC 7518 §6.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsaJwk {
    /// Key ID
    pub kid: String,
    /// Public key use (`sig`)
    #[serde(rename = "use")]
    pub public_key_use: String,
    /// Intended algorithm (`RS256`)
    pub alg: String,
    /// Modulus
    pub n: String,
    /// Public exponent
    pub e: String,
    /// Private exponent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    /// First prime factor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    /// Second prime factor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    /// First CRT exponent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,
    /// Second CRT exponent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,
    /// CRT coefficient
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,
}

impl RsaJwk {
    /// RFC 7638 thumbprint: SHA-256 over the required members in
    /// lexicographic order.
    #[must_use]
    pub fn thumbprint(&self) -> String {
        let canonical = format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, self.e, self.n);
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Strip private parameters, keeping only what belongs in a public JWKS.
    #[must_use]
    pub fn to_public(&self) -> Self {
        Self {
            d: None,
            p: None,
            q: None,
            dp: None,
            dq: None,
            qi: None,
            ..self.clone()
        }
    }

    /// Returns `true` if the private parameters needed for signing are present.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.d.is_some() && self.p.is_some() && self.q.is_some()
    }

    /// Reconstruct the RSA private key from the JWK parameters.
    pub fn to_private_key(&self) -> Result<RsaPrivateKey> {
        let n = decode_biguint(&self.n)?;
        let e = decode_biguint(&self.e)?;
        let d = decode_biguint(self.d.as_deref().ok_or_else(missing_private)?)?;
        let p = decode_biguint(self.p.as_deref().ok_or_else(missing_private)?)?;
        let q = decode_biguint(self.q.as_deref().ok_or_else(missing_private)?)?;

        RsaPrivateKey::from_components(n, e, d, vec![p, q])
            .map_err(|e| Error::Keyset(format!("invalid RSA key parameters: {e}")))
    }
}

/// Octet-sequence JWK (symmetric encryption key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OctJwk {
    /// Key ID
    pub kid: String,
    /// Public key use (`enc`)
    #[serde(rename = "use")]
    pub public_key_use: String,
    /// Intended algorithm (`A256GCM`)
    pub alg: String,
    /// Key material, base64url
    pub k: String,
}

impl OctJwk {
    /// RFC 7638 thumbprint for symmetric keys.
    #[must_use]
    pub fn thumbprint(&self) -> String {
        let canonical = format!(r#"{{"k":"{}","kty":"oct"}}"#, self.k);
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Decode the key material.
    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        URL_SAFE_NO_PAD
            .decode(&self.k)
            .map_err(|_| Error::Keyset("octet key is not valid base64url".to_string()))
    }
}

/// A JSON Web Key Set as serialized to disk, the environment, and
/// `/.well-known/jwks.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSet {
    /// The keys
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    /// Parse a JWK Set from JSON and validate it as a Takagi keyset.
    pub fn from_json(json: &str) -> Result<Self> {
        let set: Self = serde_json::from_str(json)
            .map_err(|e| Error::Keyset(format!("keyset is not valid JWK Set JSON: {e}")))?;
        set.validate()?;
        Ok(set)
    }

    /// Validate the keyset shape: exactly one private RS256 signing key and
    /// one 256-bit A256GCM encryption key, each with a non-empty `kid`.
    pub fn validate(&self) -> Result<()> {
        if self.keys.len() != 2 {
            return Err(Error::Keyset(
                "keyset must contain exactly two keys".to_string(),
            ));
        }

        let rsa = self.signing_key()?;
        if rsa.alg != "RS256" {
            return Err(Error::Keyset("the RSA key must be an RS256 key".to_string()));
        }
        if rsa.public_key_use != "sig" {
            return Err(Error::Keyset("the RSA key must support signing".to_string()));
        }
        if !rsa.is_private() {
            return Err(Error::Keyset("the RSA key must be a private key".to_string()));
        }
        if rsa.kid.is_empty() {
            return Err(Error::Keyset("the RSA key must have a kid".to_string()));
        }

        let oct = self.encryption_key()?;
        if oct.alg != "A256GCM" {
            return Err(Error::Keyset(
                "the octet sequence key must be an A256GCM key".to_string(),
            ));
        }
        if oct.public_key_use != "enc" {
            return Err(Error::Keyset(
                "the octet sequence key must support encryption".to_string(),
            ));
        }
        if oct.key_bytes()?.len() != OCT_BYTES {
            return Err(Error::Keyset(
                "the octet sequence key must be 256 bits".to_string(),
            ));
        }
        if oct.kid.is_empty() {
            return Err(Error::Keyset(
                "the octet sequence key must have a kid".to_string(),
            ));
        }

        Ok(())
    }

    /// The RSA signing key.
    pub fn signing_key(&self) -> Result<&RsaJwk> {
        self.keys
            .iter()
            .find_map(|k| match k {
                Jwk::Rsa(rsa) => Some(rsa),
                Jwk::Oct(_) => None,
            })
            .ok_or_else(|| Error::Keyset("keyset must contain an RSA key".to_string()))
    }

    /// The octet-sequence encryption key.
    pub fn encryption_key(&self) -> Result<&OctJwk> {
        self.keys
            .iter()
            .find_map(|k| match k {
                Jwk::Oct(oct) => Some(oct),
                Jwk::Rsa(_) => None,
            })
            .ok_or_else(|| {
                Error::Keyset("keyset must contain an octet sequence key".to_string())
            })
    }

    /// The public view: the RSA signing key without private parameters.
    /// The encryption key never appears here.
    #[must_use]
    pub fn public_set(&self) -> Self {
        let keys = self
            .keys
            .iter()
            .filter_map(|k| match k {
                Jwk::Rsa(rsa) => Some(Jwk::Rsa(rsa.to_public())),
                Jwk::Oct(_) => None,
            })
            .collect();
        Self { keys }
    }

    /// Generate a fresh private keyset.
    pub fn generate() -> Result<Self> {
        let mut rng = OsRng;
        let mut rsa_key = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| Error::Keyset(format!("RSA key generation failed: {e}")))?;
        rsa_key
            .precompute()
            .map_err(|e| Error::Keyset(format!("RSA key precomputation failed: {e}")))?;

        let primes = rsa_key.primes();
        let mut rsa = RsaJwk {
            kid: String::new(),
            public_key_use: "sig".to_string(),
            alg: "RS256".to_string(),
            n: encode_biguint(rsa_key.n()),
            e: encode_biguint(rsa_key.e()),
            d: Some(encode_biguint(rsa_key.d())),
            p: primes.first().map(encode_biguint),
            q: primes.get(1).map(encode_biguint),
            dp: rsa_key.dp().map(encode_biguint),
            dq: rsa_key.dq().map(encode_biguint),
            qi: rsa_key
                .qinv()
                .and_then(|qi| qi.to_biguint())
                .map(|qi| encode_biguint(&qi)),
        };
        rsa.kid = rsa.thumbprint();

        let mut oct_bytes = [0u8; OCT_BYTES];
        OsRng.fill_bytes(&mut oct_bytes);
        let mut oct = OctJwk {
            kid: String::new(),
            public_key_use: "enc".to_string(),
            alg: "A256GCM".to_string(),
            k: URL_SAFE_NO_PAD.encode(oct_bytes),
        };
        oct.kid = oct.thumbprint();

        let set = Self {
            keys: vec![Jwk::Rsa(rsa), Jwk::Oct(oct)],
        };
        set.validate()?;
        Ok(set)
    }
}

fn encode_biguint(value: &BigUint) -> String {
    URL_SAFE_NO_PAD.encode(value.to_bytes_be())
}

fn decode_biguint(value: &str) -> Result<BigUint> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| Error::Keyset("RSA parameter is not valid base64url".to_string()))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

fn missing_private() -> Error {
    Error::Keyset("the RSA key must be a private key".to_string())
}
