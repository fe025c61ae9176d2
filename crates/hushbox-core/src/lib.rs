//! Core abstractions for Hushbox: artifact records, storage contracts, error
//! taxonomy and the collaborators the vault depends on.
//! Kept free of crypto and I/O so every other crate can build on it.

pub mod artifact;
pub mod collab;
pub mod error;
pub mod retry;
pub mod storage;
