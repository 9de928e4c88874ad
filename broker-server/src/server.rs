//! The HTTP+JSON transport (C7): one `POST /v1/<endpoint>` route per RPC,
//! sharing a [`Services`] bundle as axum state. Wire framing, TLS
//! termination, and bootstrap beyond this router are out of scope; see
//! `run.rs` for where the router actually gets served.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    error_handling::HandleErrorLayer,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    routing::post,
};
use tower::{BoxError, ServiceBuilder};

use crate::services::Services;

/// Builds the four-endpoint router, fronted by a concurrency limit so an
/// overloaded broker sheds load with an explicit `503` instead of queuing
/// requests without bound.
pub fn router(services: Arc<Services>, concurrency_limit: usize) -> Router {
    // NOTE: if any of these four shapes ever needs a breaking change, bump
    // to a `/v2/...` route rather than mutating the existing one in place.
    Router::new()
        .route("/v1/GetSessionToken", post(endpoint::get_session_token))
        .route("/v1/RenewSessionToken", post(endpoint::renew_session_token))
        .route("/v1/CancelSessionToken", post(endpoint::cancel_session_token))
        .route("/v1/GetAccessToken", post(endpoint::get_access_token))
        .with_state(services)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_overload))
                .load_shed()
                .concurrency_limit(concurrency_limit),
        )
}

async fn handle_overload(err: BoxError) -> (StatusCode, String) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        format!("broker is overloaded: {err}"),
    )
}

fn authorization_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization").and_then(|v| v.to_str().ok())
}

mod endpoint {
    use std::future::Future;

    use axum::Json;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tracing::instrument;

    use broker_core::{
        auth, cache, codec,
        error::BrokerError,
        session::Session,
    };
    use broker_crypto::rng::SysRng;

    use super::*;
    use crate::{audit, error::ApiError};

    /// Runs one endpoint's fallible body, then emits the matching audit event
    /// and maps the outcome to an HTTP response. `f`'s `Err` may be either a
    /// handled [`BrokerError`] (rejected with its real code/message) or any
    /// other `anyhow::Error` (masked to `BrokerError::server_error()`).
    async fn run_endpoint<F, Fut, Resp>(
        endpoint: &'static str,
        client: String,
        f: F,
    ) -> Result<Json<Resp>, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<(Resp, serde_json::Value)>>,
    {
        match f().await {
            Ok((resp, fields)) => {
                audit::success(endpoint, &client, fields);
                Ok(Json(resp))
            }
            Err(err) => match err.downcast::<BrokerError>() {
                Ok(broker_err) => {
                    audit::reject(endpoint, &client, &broker_err, json!({}));
                    Err(ApiError::from(broker_err))
                }
                Err(err) => {
                    audit::server_error(endpoint, &client, json!({}));
                    Err(ApiError::from(err))
                }
            },
        }
    }

    fn validate_not_empty(value: &str, param: &str) -> Result<(), BrokerError> {
        if value.is_empty() {
            return Err(BrokerError::invalid_argument(format!(
                "Request must provide the `{param}` parameter"
            )));
        }
        Ok(())
    }

    fn validate_scope(scope: &str, whitelist: &[String]) -> Result<(), BrokerError> {
        let allowed = scope
            .split(',')
            .all(|s| whitelist.iter().any(|w| w == s));
        if !allowed {
            return Err(BrokerError::permission_denied(format!(
                "`{scope}` is not a whitelisted scope"
            )));
        }
        Ok(())
    }

    /// `RenewSessionToken`/`CancelSessionToken` treat a missing session and a
    /// bad session password identically: both collapse to the one
    /// [`auth::get_session_from_token`] error, which this remaps to the
    /// message the two renewal endpoints are specified to give.
    async fn load_session_for_renewal(
        services: &Services,
        token: &str,
    ) -> Result<Session, BrokerError> {
        auth::get_session_from_token(token, services.kms.as_ref(), services.sessions.as_ref())
            .await
            .map_err(|_| BrokerError::permission_denied("Session token is invalid or has expired"))
    }

    #[derive(Deserialize)]
    pub struct GetSessionTokenRequest {
        #[serde(default)]
        pub owner: String,
        #[serde(default)]
        pub renewer: String,
        #[serde(default)]
        pub target: String,
        #[serde(default)]
        pub scope: String,
    }

    #[derive(Serialize)]
    pub struct GetSessionTokenResponse {
        pub session_token: String,
    }

    #[instrument(skip_all, name = "(get-session-token)")]
    pub async fn get_session_token(
        State(services): State<Arc<Services>>,
        ConnectInfo(client): ConnectInfo<SocketAddr>,
        headers: HeaderMap,
        Json(req): Json<GetSessionTokenRequest>,
    ) -> Result<Json<GetSessionTokenResponse>, ApiError> {
        run_endpoint("GetSessionToken", client.to_string(), || async {
            let authenticated_user = services.kerberos.authenticate(authorization_header(&headers))?;
            validate_not_empty(&req.owner, "owner")?;
            validate_not_empty(&req.scope, "scope")?;
            auth::check_impersonation(&authenticated_user, &req.owner, &services.proxy_user_whitelist)?;

            let mut rng = SysRng::new();
            let session = Session::new(
                &mut rng,
                req.owner,
                req.renewer,
                req.target,
                req.scope,
                services.session_lifetime,
            );
            services
                .sessions
                .save(&session.id, session.clone())
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let session_token = codec::encode(services.kms.as_ref(), &session);

            let fields = json!({
                "owner": session.owner,
                "renewer": session.renewer,
                "session-id": session.id,
            });
            Ok((GetSessionTokenResponse { session_token }, fields))
        })
        .await
    }

    #[derive(Deserialize)]
    pub struct RenewSessionTokenRequest {
        #[serde(default)]
        pub session_token: String,
    }

    #[derive(Serialize)]
    pub struct RenewSessionTokenResponse {
        pub expires_at: u64,
    }

    #[instrument(skip_all, name = "(renew-session-token)")]
    pub async fn renew_session_token(
        State(services): State<Arc<Services>>,
        ConnectInfo(client): ConnectInfo<SocketAddr>,
        headers: HeaderMap,
        Json(req): Json<RenewSessionTokenRequest>,
    ) -> Result<Json<RenewSessionTokenResponse>, ApiError> {
        run_endpoint("RenewSessionToken", client.to_string(), || async {
            let authenticated_user = services.kerberos.authenticate(authorization_header(&headers))?;
            validate_not_empty(&req.session_token, "session_token")?;

            let mut session = load_session_for_renewal(&services, &req.session_token).await?;
            if session.renewer != authenticated_user {
                return Err(BrokerError::permission_denied(format!(
                    "Unauthorized renewer: {authenticated_user}"
                ))
                .into());
            }

            session.extend_lifetime(services.session_lifetime);
            services
                .sessions
                .save(&session.id, session.clone())
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;

            let fields = json!({
                "owner": session.owner,
                "renewer": session.renewer,
                "session-id": session.id,
            });
            Ok((
                RenewSessionTokenResponse {
                    expires_at: session.expires_at,
                },
                fields,
            ))
        })
        .await
    }

    #[derive(Deserialize)]
    pub struct CancelSessionTokenRequest {
        #[serde(default)]
        pub session_token: String,
    }

    #[derive(Serialize)]
    pub struct CancelSessionTokenResponse {}

    #[instrument(skip_all, name = "(cancel-session-token)")]
    pub async fn cancel_session_token(
        State(services): State<Arc<Services>>,
        ConnectInfo(client): ConnectInfo<SocketAddr>,
        headers: HeaderMap,
        Json(req): Json<CancelSessionTokenRequest>,
    ) -> Result<Json<CancelSessionTokenResponse>, ApiError> {
        run_endpoint("CancelSessionToken", client.to_string(), || async {
            let authenticated_user = services.kerberos.authenticate(authorization_header(&headers))?;
            validate_not_empty(&req.session_token, "session_token")?;

            let session = load_session_for_renewal(&services, &req.session_token).await?;
            if session.renewer != authenticated_user {
                return Err(BrokerError::permission_denied(format!(
                    "Unauthorized renewer: {authenticated_user}"
                ))
                .into());
            }

            services
                .sessions
                .delete(&session.id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;

            let fields = json!({
                "owner": session.owner,
                "renewer": session.renewer,
                "session-id": session.id,
            });
            Ok((CancelSessionTokenResponse {}, fields))
        })
        .await
    }

    #[derive(Deserialize)]
    pub struct GetAccessTokenRequest {
        #[serde(default)]
        pub owner: String,
        #[serde(default)]
        pub scope: String,
        #[serde(default)]
        pub target: String,
    }

    #[derive(Serialize)]
    pub struct GetAccessTokenResponse {
        pub access_token: String,
        pub expires_at: u64,
    }

    #[instrument(skip_all, name = "(get-access-token)")]
    pub async fn get_access_token(
        State(services): State<Arc<Services>>,
        ConnectInfo(client): ConnectInfo<SocketAddr>,
        headers: HeaderMap,
        Json(req): Json<GetAccessTokenRequest>,
    ) -> Result<Json<GetAccessTokenResponse>, ApiError> {
        run_endpoint("GetAccessToken", client.to_string(), || async {
            let authorization = authorization_header(&headers);
            let session =
                auth::authenticate_session(authorization, services.kms.as_ref(), services.sessions.as_ref())
                    .await?;

            match session {
                Some(session) => {
                    validate_not_empty(&req.owner, "owner")?;
                    validate_not_empty(&req.scope, "scope")?;
                    if req.target != session.target {
                        return Err(BrokerError::permission_denied("Target mismatch").into());
                    }
                    let owner_local = session.owner.split('@').next().unwrap_or(&session.owner);
                    if req.owner != session.owner && req.owner != owner_local {
                        return Err(BrokerError::permission_denied("Owner mismatch").into());
                    }
                    if req.scope != session.scope {
                        return Err(BrokerError::permission_denied("Scope mismatch").into());
                    }
                }
                None => {
                    let authenticated_user = services.kerberos.authenticate(authorization)?;
                    validate_not_empty(&req.owner, "owner")?;
                    validate_not_empty(&req.scope, "scope")?;
                    auth::check_impersonation(&authenticated_user, &req.owner, &services.proxy_user_whitelist)?;
                }
            }

            validate_scope(&req.scope, &services.scope_whitelist)?;

            let provider = &services.provider;
            let owner = req.owner.clone();
            let scope = req.scope.clone();
            let token = cache::get_or_mint(
                &services.l1_cache,
                services.l2_cache.as_ref(),
                &owner,
                &scope,
                services.cache_ttls,
                || {
                    let owner = owner.clone();
                    let scope = scope.clone();
                    async move { Ok(provider.mint_access_token(&owner, &scope).await?) }
                },
            )
            .await
            .map_err(|e| match e {
                cache::CacheError::Mint(broker_err) => anyhow::Error::new(broker_err),
                other => anyhow::anyhow!("{other}"),
            })?;

            let fields = json!({"owner": req.owner, "scope": req.scope});
            Ok((
                GetAccessTokenResponse {
                    access_token: token.value,
                    expires_at: token.expires_at,
                },
                fields,
            ))
        })
        .await
    }
}
