//! Secret code -> 32-byte key, via Argon2id.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes over memory.
    pub iterations: u32,
    /// Degree of parallelism (lanes).
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests. Never use for stored data.
    pub fn light() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn to_argon2(self) -> Result<Params, CryptoError> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CryptoError::InvalidParams(e.to_string()))
    }
}

/// Symmetric key derived from a secret code. Zeroized on drop; never log it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

/// Deterministic, deliberately slow key derivation.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    params: Params,
}

impl KeyDeriver {
    pub fn new(params: KdfParams) -> Result<Self, CryptoError> {
        Ok(Self {
            params: params.to_argon2()?,
        })
    }

    /// Derive the key for `secret` under `salt`. Same inputs, same key.
    /// CPU bound: call from a blocking context.
    pub fn derive(&self, secret: &[u8], salt: &[u8]) -> Result<DerivedKey, CryptoError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let mut output = [0u8; KEY_LEN];
        argon2
            .hash_password_into(secret, salt, &mut output)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let key = DerivedKey(output);
        output.zeroize();
        Ok(key)
    }
}

/// Fresh random salt; stored next to the ciphertext, not secret.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}
