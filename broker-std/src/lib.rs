//! # `broker-std`
//!
//! This crate contains "std extensions" which other broker crates can use
//! without having to pull in any dependencies.
//!
//! Traits, small helper functions, and a small number of types are all fair
//! game so long as they do NOT depend on anything outside of [`std`].

/// Small helper functions for `[u8; N]` arrays, used by the session-token and
/// cache-fingerprint codecs.
pub mod array;
/// Exponential backoff iterators for retrying locked or rate-limited calls.
pub mod backoff;
