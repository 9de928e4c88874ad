//! The broker's error taxonomy: a single kind enum, surfaced to clients
//! verbatim when handled and masked to `Unknown` / "Server error" when not.

use std::fmt;

use thiserror::Error;

/// The RPC-level kind a [`BrokerError`] maps to. Mirrors the small,
/// fixed status enumeration the endpoints are specified against rather than
/// a full gRPC status set.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BrokerErrorKind {
    /// No credential was presented, or it was malformed.
    Unauthenticated,
    /// A credential was presented but failed verification, or the caller is
    /// not authorised for the requested action.
    PermissionDenied,
    /// A required request field was missing or empty.
    InvalidArgument,
    /// Preserved from the source service's bug: an expired session token is
    /// reported this way instead of `PermissionDenied`. See `DESIGN.md`.
    Unimplemented,
    /// Any other failure. Never constructed with a caller-supplied message;
    /// always carries the fixed `"Server error"` text at the client
    /// boundary.
    Unknown,
}

impl BrokerErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handled broker error: `{kind, message}`, surfaced to the client
/// verbatim. Construct via the `abort_*` helpers below rather than directly,
/// so every call site reads like the condition it represents.
#[derive(Clone, Debug, Error)]
#[error("{kind}: {message}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::PermissionDenied, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::InvalidArgument, message)
    }

    /// See [`BrokerErrorKind::Unimplemented`]: preserved bug-compatibility
    /// for an expired session, not a real "not implemented" condition.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Unimplemented, message)
    }

    /// The client-visible text for any unhandled `anyhow::Error` that
    /// reaches the endpoint boundary. The original cause is logged, never
    /// returned.
    pub fn server_error() -> Self {
        Self::new(BrokerErrorKind::Unknown, "Server error")
    }

    /// `true` for [`BrokerErrorKind::Unknown`], used to pick the audit
    /// record's `responseType` (`reject` vs `server-error`).
    pub fn is_server_error(&self) -> bool {
        self.kind == BrokerErrorKind::Unknown
    }
}

/// Shorthand matching the source's `abort(code, message)`: build and
/// immediately return a [`BrokerError`] from a fallible function.
pub fn abort<T>(kind: BrokerErrorKind, message: impl Into<String>) -> Result<T, BrokerError> {
    Err(BrokerError::new(kind, message))
}
