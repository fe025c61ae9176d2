//! AES-256-GCM over opaque payloads.
//!
//! A fresh 96-bit nonce is drawn from the OS RNG on every call. Associated
//! data binds a ciphertext to the record it was written for.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::{error::CryptoError, key_derivation::DerivedKey};

pub const NONCE_LEN: usize = 12;

/// Output of [`encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

pub fn encrypt(key: &DerivedKey, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = build_cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce.as_slice());
    Ok(Sealed {
        ciphertext,
        nonce: nonce_bytes,
    })
}

/// Fails closed: a wrong key, wrong associated data or any tampering yields
/// `CryptoError::Decrypt` and no plaintext.
pub fn decrypt(
    key: &DerivedKey,
    ciphertext: &[u8],
    nonce: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonce {
            expected: NONCE_LEN,
            got: nonce.len(),
        });
    }
    let cipher = build_cipher(key)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)?;
    Ok(Zeroizing::new(plaintext))
}

fn build_cipher(key: &DerivedKey) -> Result<Aes256Gcm, CryptoError> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Encrypt)
}
