//! A crate containing utilities and extensions built on top of Tokio, used to
//! run the token broker's RPC server with structured shutdown.

/// A channel for sending deduplicated notifications with no data attached.
pub mod notify;
/// `NotifyOnce`, used as the server's shutdown channel.
pub mod notify_once;
/// `BrokerTask` and associated helpers.
pub mod task;

// Can save a `tokio` dependency declaration
pub use tokio;
