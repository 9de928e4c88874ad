//! Structured audit logging: one event per endpoint call, carrying the
//! endpoint name, caller, and outcome. Fields are built explicitly by each
//! handler from non-secret request/response data — never a password,
//! bearer token, or decrypted refresh token.

use broker_core::error::BrokerError;
use serde_json::Value;

/// The endpoint completed and produced a response.
pub fn success(endpoint: &'static str, client: &str, fields: Value) {
    tracing::info!(
        endpoint,
        client,
        response_type = "success",
        %fields,
        "endpoint completed"
    );
}

/// The endpoint rejected the request with a handled [`BrokerError`]
/// (unauthenticated, permission denied, invalid argument, ...).
pub fn reject(endpoint: &'static str, client: &str, err: &BrokerError, fields: Value) {
    tracing::warn!(
        endpoint,
        client,
        response_type = "reject",
        code = %err.kind,
        message = %err.message,
        %fields,
        "endpoint rejected"
    );
}

/// The endpoint failed on an unhandled error. The real cause was already
/// logged by [`crate::error::ApiError`]'s `From<anyhow::Error>`; this event
/// only records that it happened, for the same audit trail as every other
/// outcome.
pub fn server_error(endpoint: &'static str, client: &str, fields: Value) {
    tracing::error!(
        endpoint,
        client,
        response_type = "server-error",
        code = "UNKNOWN",
        %fields,
        "endpoint failed"
    );
}
