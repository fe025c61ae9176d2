use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key derivation parameters: {0}")]
    InvalidParams(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("AEAD encryption failed")]
    Encrypt,

    /// Wrong key or tampered ciphertext. Deliberately carries no detail.
    #[error("AEAD decryption failed")]
    Decrypt,

    #[error("nonce must be {expected} bytes, got {got}")]
    InvalidNonce { expected: usize, got: usize },
}
