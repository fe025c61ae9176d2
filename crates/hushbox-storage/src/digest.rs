//! Verification digest stored next to each ciphertext.
//!
//! The digest is computed over the derived key rather than the raw secret code,
//! so recovering a secret from a leaked digest costs as much as attacking the
//! ciphertext itself. It is a diagnostic cross-check only; decryption decides
//! access.

use sha2::{Digest, Sha256};

use crate::key_derivation::DerivedKey;

const DOMAIN: &[u8] = b"hushbox-secret-digest-v1\x00";
const LOCATOR_DOMAIN: &[u8] = b"hushbox-record-locator-v1\x00";

/// Hex SHA-256 of `domain || salt || key`.
pub fn secret_digest(key: &DerivedKey, salt: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);
    hasher.update(salt);
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Store address of a record: hex SHA-256 of `domain || key`, where `key` is
/// derived from the lookup key under a fixed salt. Lookup keys are short, so
/// the slow derivation is what keeps the address from being reversed.
pub fn record_locator(key: &DerivedKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(LOCATOR_DOMAIN);
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of a freshly computed digest with a stored one.
pub fn verify_digest(key: &DerivedKey, salt: &[u8], stored_hex: &str) -> bool {
    let computed = secret_digest(key, salt);
    constant_time_eq(computed.as_bytes(), stored_hex.as_bytes())
}

/// Compares without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
