//! Credential vault: API key issuance and digest verification.
//!
//! Keys are opaque URL-safe bearer tokens. Only a salted bcrypt digest is
//! ever persisted; the plaintext exists exactly once, in the registration
//! response, and is wiped from memory on drop.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;
use zeroize::Zeroize;

use crate::error::{AppError, AppResult};

/// Entropy of a generated API key, before encoding.
pub const API_KEY_ENTROPY_BYTES: usize = 32;

/// A freshly issued plaintext API key.
///
/// Never stored. The holder shows it to the operator once and drops it.
pub struct PlainApiKey(String);

impl PlainApiKey {
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl Drop for PlainApiKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for PlainApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PlainApiKey(***)")
    }
}

/// Generate a cryptographically random API key.
pub fn generate_api_key() -> PlainApiKey {
    let mut bytes = [0u8; API_KEY_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let key = PlainApiKey(URL_SAFE_NO_PAD.encode(bytes));
    bytes.zeroize();
    key
}

/// Hash an API key with a per-call random salt at the given work factor.
pub fn hash_api_key(api_key: &str, cost: u32) -> AppResult<String> {
    bcrypt::hash(api_key, cost)
        .map_err(|e| AppError::internal(format!("API key hashing failed: {e}")))
}

/// Verify a presented API key against a stored digest.
///
/// A malformed digest counts as a failed verification, never an error, so a
/// corrupted stored digest cannot take down anything beyond that one client.
pub fn verify_api_key(api_key: &str, digest: &str) -> bool {
    match bcrypt::verify(api_key, digest) {
        Ok(matched) => matched,
        Err(e) => {
            warn!("Rejecting API key presented against unparseable digest: {e}");
            false
        }
    }
}
