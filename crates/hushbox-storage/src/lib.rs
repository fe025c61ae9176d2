//! Crypto primitives and durable storage for encrypted artifacts.
//! Argon2id turns secret codes into keys, AES-256-GCM seals payloads, and
//! records land on disk one JSON document per artifact.

pub mod cipher;
pub mod digest;
pub mod error;
pub mod file_record_store;
pub mod key_derivation;

pub use error::CryptoError;
