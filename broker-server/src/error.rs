//! Maps [`broker_core::error::BrokerError`] onto HTTP, and collapses any
//! unhandled `anyhow::Error` that reaches a handler into the one opaque
//! [`BrokerErrorKind::Unknown`] the client is allowed to see.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use broker_core::error::{BrokerError, BrokerErrorKind};
use serde::Serialize;

/// Newtype so this crate can impl `IntoResponse` on a `broker-core` type
/// without making `broker-core` depend on axum.
pub struct ApiError(pub BrokerError);

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            BrokerErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            BrokerErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            BrokerErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            BrokerErrorKind::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            BrokerErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            code: self.0.kind.to_string(),
            message: self.0.message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

/// Every handler's fallible internals return `anyhow::Result`; this is the
/// one place that collapses an unhandled cause into the opaque
/// `BrokerError::server_error()` the client sees, logging the real cause
/// first.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = ?err, "unhandled error at endpoint boundary");
        Self(BrokerError::server_error())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unauthenticated_maps_to_401() {
        let resp = ApiError(BrokerError::unauthenticated("nope")).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn unknown_maps_to_500() {
        let resp = ApiError::from(anyhow::anyhow!("boom")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
