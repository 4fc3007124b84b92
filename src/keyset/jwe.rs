//! Compact JWE with direct A256GCM encryption.
//!
//! Implements the five-segment compact serialization of RFC 7516 for the
//! one combination Takagi uses: `alg=dir`, `enc=A256GCM`. The encrypted-key
//! segment is always empty (direct encryption), the protected header is the
//! AAD, and the 96-bit IV is random per message.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use serde::Deserialize;

use crate::{Error, Result};

/// AES-GCM nonce length in bytes.
const IV_BYTES: usize = 12;

#[derive(Debug, Deserialize)]
struct JweHeader {
    alg: String,
    enc: String,
}

/// Encrypt `plaintext` under the 256-bit key, producing a compact JWE.
///
/// The `kid` of the encryption key is recorded in the protected header so a
/// rotated keyset can be diagnosed from the token alone.
pub fn encrypt(key: &[u8], kid: &str, plaintext: &[u8]) -> Result<String> {
    let header = format!(r#"{{"alg":"dir","enc":"A256GCM","kid":"{kid}"}}"#);
    let header_b64 = URL_SAFE_NO_PAD.encode(header.as_bytes());

    let mut iv = [0u8; IV_BYTES];
    OsRng.fill_bytes(&mut iv);

    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Keyset("encryption key has the wrong length".to_string()))?;
    let sealing = LessSafeKey::new(unbound);

    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(iv),
            Aad::from(header_b64.as_bytes()),
            &mut in_out,
        )
        .map_err(|_| Error::Decrypt)?;

    let tag_start = in_out.len() - AES_256_GCM.tag_len();
    let (ciphertext, tag) = in_out.split_at(tag_start);

    Ok(format!(
        "{}..{}.{}.{}",
        header_b64,
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(ciphertext),
        URL_SAFE_NO_PAD.encode(tag),
    ))
}

/// Decrypt a compact JWE produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`Error::Decrypt`] on any malformed input, unsupported header,
/// or authentication failure. Callers map this to `invalid_token` /
/// `invalid_grant` without distinguishing the cause.
pub fn decrypt(key: &[u8], compact: &str) -> Result<Vec<u8>> {
    let parts: Vec<&str> = compact.split('.').collect();
    if parts.len() != 5 || !parts[1].is_empty() {
        return Err(Error::Decrypt);
    }

    let header_bytes = URL_SAFE_NO_PAD.decode(parts[0]).map_err(|_| Error::Decrypt)?;
    let header: JweHeader = serde_json::from_slice(&header_bytes).map_err(|_| Error::Decrypt)?;
    if header.alg != "dir" || header.enc != "A256GCM" {
        return Err(Error::Decrypt);
    }

    let iv = URL_SAFE_NO_PAD.decode(parts[2]).map_err(|_| Error::Decrypt)?;
    let ciphertext = URL_SAFE_NO_PAD.decode(parts[3]).map_err(|_| Error::Decrypt)?;
    let tag = URL_SAFE_NO_PAD.decode(parts[4]).map_err(|_| Error::Decrypt)?;
    if iv.len() != IV_BYTES || tag.len() != AES_256_GCM.tag_len() {
        return Err(Error::Decrypt);
    }

    let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| Error::Decrypt)?;
    let opening = LessSafeKey::new(unbound);

    let nonce = Nonce::try_assume_unique_for_key(&iv).map_err(|_| Error::Decrypt)?;
    let mut in_out = [ciphertext, tag].concat();
    // The received protected header is the AAD, byte for byte.
    let plaintext = opening
        .open_in_place(nonce, Aad::from(parts[0].as_bytes()), &mut in_out)
        .map_err(|_| Error::Decrypt)?;

    Ok(plaintext.to_vec())
}
