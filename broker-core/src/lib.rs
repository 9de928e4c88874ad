//! `broker-core`: the credential-mediation domain model, independent of any
//! particular transport. A `broker-server` binary wires these pieces to
//! axum handlers; this crate owns the session, codec, authentication,
//! caching, and provider logic they call into.

pub mod auth;
pub mod cache;
pub mod codec;
pub mod error;
pub mod provider;
pub mod session;
