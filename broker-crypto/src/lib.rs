//! Cryptographic primitives for the token broker: an AES-256-GCM envelope
//! (`aes`) and the [`kms::Kms`] contract built on top of it.

// Re-exported so callers wrap secrets (session passwords, decrypted refresh
// tokens) without declaring their own `secrecy` dependency.
pub use secrecy::{ExposeSecret, Secret};

pub mod aes;
pub mod hex;
pub mod kms;
pub mod rng;
