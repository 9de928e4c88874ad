//! The token broker: a credential-mediation service that issues session
//! tokens, renews and cancels them, and mints short-lived cloud access tokens
//! on a session's or a Kerberos principal's behalf.

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod or_env;
pub mod run;
pub mod server;
pub mod services;
