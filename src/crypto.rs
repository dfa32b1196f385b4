//! Credential encryption and token hashing
//!
//! Mailbox credentials are sealed with AES-256-GCM into opaque
//! base64 blobs packed as `IV(12) ‖ tag(16) ‖ ciphertext`. Access
//! tokens are never stored raw; only their SHA-256 hex digest is.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Process-wide credential cipher. Built once at startup from the
/// configured key material; the key itself is never logged.
pub struct BlobCipher {
    cipher: Aes256Gcm,
}

impl BlobCipher {
    /// Derive the 256-bit key and build the cipher.
    ///
    /// A 64-character hex string is decoded directly to 32 bytes;
    /// any other input is reduced to 32 bytes with SHA-256.
    #[must_use]
    pub fn new(key_material: &str) -> Self {
        let key_bytes: [u8; 32] = if key_material.len() == 64 {
            hex::decode(key_material).map_or_else(
                |_| Sha256::digest(key_material.as_bytes()).into(),
                |decoded| {
                    decoded
                        .try_into()
                        .unwrap_or_else(|_| Sha256::digest(key_material.as_bytes()).into())
                },
            )
        } else {
            Sha256::digest(key_material.as_bytes()).into()
        };

        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes)),
        }
    }

    /// Encrypt plaintext into a transportable base64 blob.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| Error::Encryption(format!("encrypt failed: {e}")))?;

        // AEAD output is ciphertext ‖ tag; the blob format wants
        // IV ‖ tag ‖ ciphertext.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut blob = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(tag);
        blob.extend_from_slice(ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a blob produced by [`BlobCipher::encrypt`].
    ///
    /// Rejects anything shorter than `IV + tag + 1` byte; GCM
    /// authentication failures are surfaced as encryption errors.
    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>> {
        let raw = BASE64
            .decode(blob)
            .map_err(|e| Error::Encryption(format!("invalid blob encoding: {e}")))?;

        if raw.len() < IV_LEN + TAG_LEN + 1 {
            return Err(Error::Encryption("blob too short".into()));
        }

        let (iv, rest) = raw.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        self.cipher
            .decrypt(Nonce::from_slice(iv), sealed.as_slice())
            .map_err(|e| Error::Encryption(format!("decrypt failed: {e}")))
    }

    /// Decrypt a blob into a UTF-8 string.
    pub fn decrypt_string(&self, blob: &str) -> Result<String> {
        let bytes = self.decrypt(blob)?;
        String::from_utf8(bytes).map_err(|_| Error::Encryption("plaintext is not UTF-8".into()))
    }
}

/// SHA-256 digest of a raw token, as 64 lowercase hex characters.
#[must_use]
pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// SHA-256 checksum of attachment content, as lowercase hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Constant-time comparison of two secrets.
///
/// Both sides are hashed to equal-length digests first, so the
/// comparison never leaks length or prefix information.
#[must_use]
pub fn secure_compare(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    da.iter().zip(db.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
