//! Keyset management.
//!
//! A keyset is one RSA RS256 signing key plus one A256GCM octet encryption
//! key. Keysets are either *managed* (generated on first startup and
//! persisted under the data directory) or *externally supplied* (environment
//! variable or file, validated and never persisted).
//!
//! Rotation swaps the in-memory keyset pointer atomically. Readers take an
//! [`Arc`] snapshot before verifying or minting, so a single request always
//! observes one coherent generation of signing and encryption keys. Rotation
//! deliberately retains no old keys: every previously issued token becomes
//! invalid at once.

mod jwe;
mod jwk;

pub use jwk::{Jwk, JwkSet, OctJwk, RsaJwk};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jsonwebtoken::{DecodingKey, EncodingKey};
use parking_lot::RwLock;
use rsa::pkcs1::EncodeRsaPrivateKey;
use tracing::{info, warn};

use crate::config::Settings;
use crate::{Error, Result};

/// File name of the managed keyset inside the data directory.
const KEYSET_FILE_NAME: &str = "keyset.json";

/// A loaded keyset, ready for signing, verification, and encryption.
pub struct Keyset {
    signing_kid: String,
    encryption_kid: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    enc_key: Vec<u8>,
    jwks: JwkSet,
}

impl Keyset {
    /// Build the cryptographic material from a validated JWK Set.
    pub fn from_jwks(jwks: JwkSet) -> Result<Self> {
        jwks.validate()?;

        let rsa = jwks.signing_key()?;
        let private_key = rsa.to_private_key()?;
        let der = private_key
            .to_pkcs1_der()
            .map_err(|e| Error::Keyset(format!("RSA key encoding failed: {e}")))?;
        let encoding_key = EncodingKey::from_rsa_der(der.as_bytes());
        let decoding_key = DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
            .map_err(|e| Error::Keyset(format!("invalid RSA public parameters: {e}")))?;

        let oct = jwks.encryption_key()?;
        let enc_key = oct.key_bytes()?;

        Ok(Self {
            signing_kid: rsa.kid.clone(),
            encryption_kid: oct.kid.clone(),
            encoding_key,
            decoding_key,
            enc_key,
            jwks,
        })
    }

    /// `kid` of the signing key, embedded in every JWS header.
    #[must_use]
    pub fn signing_kid(&self) -> &str {
        &self.signing_kid
    }

    /// Signing key for `jsonwebtoken::encode`.
    #[must_use]
    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    /// Verification key for `jsonwebtoken::decode`.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Encrypt plaintext into a compact JWE under the encryption key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        jwe::encrypt(&self.enc_key, &self.encryption_kid, plaintext)
    }

    /// Decrypt a compact JWE produced by [`Keyset::encrypt`].
    pub fn decrypt(&self, compact: &str) -> Result<Vec<u8>> {
        jwe::decrypt(&self.enc_key, compact)
    }

    /// Public JWKS for `/.well-known/jwks.json`: the signing key only,
    /// never the encryption key, never private material.
    #[must_use]
    pub fn public_jwks(&self) -> JwkSet {
        self.jwks.public_set()
    }
}

/// Where the active keyset came from.
enum KeysetSource {
    /// Generated and persisted under the data directory.
    Managed(PathBuf),
    /// Supplied via environment or file; never written back.
    External,
}

/// Holds the active keyset and performs rotation.
pub struct KeysetManager {
    current: RwLock<Arc<Keyset>>,
    source: KeysetSource,
}

impl KeysetManager {
    /// Load the keyset per the configured precedence: `KEYSET` env value,
    /// then `KEYSET_FILE`, then the managed file under the data directory
    /// (generated on first run).
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        if let Some(json) = &settings.keyset {
            let jwks = JwkSet::from_json(json)?;
            info!("Using a custom private keyset");
            return Self::external(jwks);
        }

        if let Some(path) = &settings.keyset_file {
            let json = fs::read_to_string(path).map_err(|e| {
                Error::Keyset(format!("cannot read keyset file {}: {e}", path.display()))
            })?;
            let jwks = JwkSet::from_json(&json)?;
            info!(path = %path.display(), "Using a custom private keyset from file");
            return Self::external(jwks);
        }

        let path = settings.data_dir.join(KEYSET_FILE_NAME);
        let jwks = load_or_generate(&path)?;
        let keyset = Arc::new(Keyset::from_jwks(jwks)?);
        Ok(Self {
            current: RwLock::new(keyset),
            source: KeysetSource::Managed(path),
        })
    }

    fn external(jwks: JwkSet) -> Result<Self> {
        let keyset = Arc::new(Keyset::from_jwks(jwks)?);
        Ok(Self {
            current: RwLock::new(keyset),
            source: KeysetSource::External,
        })
    }

    /// Snapshot of the active keyset. Hold the returned [`Arc`] for the
    /// duration of one verification or minting operation; never re-read
    /// mid-request.
    #[must_use]
    pub fn current(&self) -> Arc<Keyset> {
        self.current.read().clone()
    }

    /// Generate a fresh keyset, persist it, and publish it atomically.
    ///
    /// Every token issued under the previous keyset is invalid afterwards.
    ///
    /// # Errors
    ///
    /// Fails for externally supplied keysets; those are rotated by the
    /// operator, not by Takagi.
    pub fn rotate(&self) -> Result<String> {
        let KeysetSource::Managed(path) = &self.source else {
            return Err(Error::Keyset(
                "the keyset is externally supplied; rotate it at its source".to_string(),
            ));
        };

        let jwks = JwkSet::generate()?;
        persist(path, &jwks)?;
        let keyset = Arc::new(Keyset::from_jwks(jwks)?);
        let kid = keyset.signing_kid().to_string();
        *self.current.write() = keyset;
        info!(kid = %kid, "Rotated keyset; all previously issued tokens are now invalid");
        Ok(kid)
    }
}

/// Load the managed keyset, generating and persisting a fresh one when the
/// file is missing or unreadable.
fn load_or_generate(path: &Path) -> Result<JwkSet> {
    if path.exists() {
        match fs::read_to_string(path) {
            Ok(json) => match JwkSet::from_json(&json) {
                Ok(jwks) => return Ok(jwks),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Managed keyset is invalid, regenerating");
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read managed keyset, regenerating");
            }
        }
    }

    let jwks = JwkSet::generate()?;
    persist(path, &jwks)?;
    info!(path = %path.display(), "Generated a new managed keyset");
    Ok(jwks)
}

/// Write the keyset to disk with owner-only permissions, replacing any
/// previous file atomically (temp file + rename).
fn persist(path: &Path, jwks: &JwkSet) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Keyset("keyset path has no parent directory".to_string()))?;
    fs::create_dir_all(parent)?;

    let json = serde_json::to_string(jwks)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp, path)?;
    Ok(())
}
