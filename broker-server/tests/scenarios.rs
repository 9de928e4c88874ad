//! End-to-end coverage of the four RPC endpoints against the axum `Router`
//! directly, via `tower::ServiceExt::oneshot` (no real socket). Each test
//! name matches the scenario it covers; see `SPEC_FULL.md` §8.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use broker_core::{
    auth::{FakeGssapiAcceptor, KerberosAuthenticator},
    cache::{AccessToken, CacheTtls, InMemoryCache, InMemoryL2Cache},
    codec,
    provider::FakeProvider,
    session::{InMemoryRecordStore, RecordStore, Session, SessionLifetime},
};
use broker_crypto::{
    kms::{DevKms, Kms},
    Secret,
};
use broker_server::{server, services::Services};

const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

fn lifetime() -> SessionLifetime {
    SessionLifetime {
        renew_period_ms: 86_400_000,
        maximum_lifetime_ms: 7 * 86_400_000,
    }
}

fn services(provider_token: AccessToken) -> Arc<Services> {
    Arc::new(Services {
        sessions: Arc::new(InMemoryRecordStore::<Session>::new()),
        kms: Arc::new(DevKms::new(&[1u8; 32], &[2u8; 32], &[3u8; 32])) as Arc<dyn Kms>,
        l1_cache: InMemoryCache::new(),
        l2_cache: Arc::new(InMemoryL2Cache::new()),
        cache_ttls: CacheTtls {
            local_secs: 60,
            remote_secs: 1_800,
        },
        kerberos: KerberosAuthenticator::new(
            Box::new(FakeGssapiAcceptor),
            "broker".to_owned(),
            "broker.example.com".to_owned(),
        ),
        provider: Box::new(FakeProvider(provider_token)),
        session_lifetime: lifetime(),
        scope_whitelist: vec![SCOPE.to_owned()],
        proxy_user_whitelist: vec![],
    })
}

fn negotiate_header(principal: &str) -> String {
    format!("Negotiate {}", STANDARD.encode(principal.as_bytes()))
}

async fn post(
    services: &Arc<Services>,
    path: &str,
    authorization: Option<&str>,
    body: Value,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/v1/{path}"))
        .header("content-type", "application/json")
        .extension(axum::extract::ConnectInfo(std::net::SocketAddr::from((
            [127, 0, 0, 1],
            0,
        ))));
    if let Some(authorization) = authorization {
        builder = builder.header("authorization", authorization);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();

    let response = server::router(services.clone(), 10)
        .oneshot(request)
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn s1_get_session_token_binds_owner_and_renewer() {
    let services = services(AccessToken {
        value: "unused".to_owned(),
        expires_at: 0,
    });

    let (status, body) = post(
        &services,
        "GetSessionToken",
        Some(&negotiate_header("alice@EXAMPLE.COM")),
        json!({
            "owner": "alice@EXAMPLE.COM",
            "renewer": "yarn@FOO.BAR",
            "target": "gs://example",
            "scope": SCOPE,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let token = body["session_token"].as_str().unwrap();
    let (session_id, ciphertext) = codec::decode(token).unwrap();
    let session = services.sessions.get(&session_id).await.unwrap();
    assert_eq!(session.owner, "alice@EXAMPLE.COM");
    assert_eq!(session.renewer, "yarn@FOO.BAR");
    assert!(codec::verify(services.kms.as_ref(), &session, ciphertext));
}

#[tokio::test]
async fn s2_cancel_session_token_requires_the_renewer() {
    let services = services(AccessToken {
        value: "unused".to_owned(),
        expires_at: 0,
    });

    let (_, body) = post(
        &services,
        "GetSessionToken",
        Some(&negotiate_header("alice@EXAMPLE.COM")),
        json!({
            "owner": "alice@EXAMPLE.COM",
            "renewer": "yarn@FOO.BAR",
            "target": "gs://example",
            "scope": SCOPE,
        }),
    )
    .await;
    let token = body["session_token"].as_str().unwrap().to_owned();
    let (session_id, _) = codec::decode(&token).unwrap();

    let (status, body) = post(
        &services,
        "CancelSessionToken",
        Some(&negotiate_header("baz@FOO.BAR")),
        json!({ "session_token": token }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Unauthorized renewer: baz@FOO.BAR");
    assert!(services.sessions.get(&session_id).await.is_ok());

    let (status, _) = post(
        &services,
        "CancelSessionToken",
        Some(&negotiate_header("yarn@FOO.BAR")),
        json!({ "session_token": token }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(services.sessions.get(&session_id).await.is_err());
}

#[tokio::test]
async fn s3_renew_session_token_extends_by_the_renew_period() {
    let services = services(AccessToken {
        value: "unused".to_owned(),
        expires_at: 0,
    });

    let (_, body) = post(
        &services,
        "GetSessionToken",
        Some(&negotiate_header("alice@EXAMPLE.COM")),
        json!({
            "owner": "alice@EXAMPLE.COM",
            "renewer": "yarn@FOO.BAR",
            "target": "gs://example",
            "scope": SCOPE,
        }),
    )
    .await;
    let token = body["session_token"].as_str().unwrap().to_owned();

    let before = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let (status, body) = post(
        &services,
        "RenewSessionToken",
        Some(&negotiate_header("yarn@FOO.BAR")),
        json!({ "session_token": token }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let expires_at = body["expires_at"].as_u64().unwrap();
    assert!(expires_at >= before + lifetime().renew_period_ms);
    assert!(expires_at <= before + lifetime().renew_period_ms + 5_000);
}

#[tokio::test]
async fn s4_get_access_token_via_kerberos_mints_and_caches() {
    let services = services(AccessToken {
        value: "my-oauth-token".to_owned(),
        expires_at: 999_999,
    });

    let (status, body) = post(
        &services,
        "GetAccessToken",
        Some(&negotiate_header("alice@EXAMPLE.COM")),
        json!({ "owner": "alice@EXAMPLE.COM", "scope": SCOPE, "target": "" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["access_token"], "my-oauth-token");
    assert_eq!(body["expires_at"], 999_999);

    let fingerprint = broker_core::cache::fingerprint("alice@EXAMPLE.COM", SCOPE);
    assert!(services.l1_cache.get_fresh(&fingerprint).is_some());
}

#[tokio::test]
async fn s5_get_access_token_via_session_rejects_target_mismatch() {
    let services = services(AccessToken {
        value: "unused".to_owned(),
        expires_at: 0,
    });

    let mut rng = broker_crypto::rng::TestRng::from_u64(7);
    let session = Session::new(
        &mut rng,
        "alice@EXAMPLE.COM".to_owned(),
        "yarn@FOO.BAR".to_owned(),
        "gs://mock-bucket".to_owned(),
        SCOPE.to_owned(),
        lifetime(),
    );
    services
        .sessions
        .save(&session.id, session.clone())
        .await
        .unwrap();
    let token = codec::encode(services.kms.as_ref(), &session);

    let (status, body) = post(
        &services,
        "GetAccessToken",
        Some(&format!("BrokerSession {token}")),
        json!({ "owner": "alice@EXAMPLE.COM", "scope": SCOPE, "target": "gs://other" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Target mismatch");
}

#[tokio::test]
async fn s6_get_access_token_rejects_garbage_session_token() {
    let services = services(AccessToken {
        value: "unused".to_owned(),
        expires_at: 0,
    });

    let (status, body) = post(
        &services,
        "GetAccessToken",
        Some("BrokerSession foobar"),
        json!({ "owner": "alice@EXAMPLE.COM", "scope": SCOPE, "target": "gs://example" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid session token");
}

#[tokio::test]
async fn s7_get_access_token_rejects_a_session_whose_password_changed() {
    let services = services(AccessToken {
        value: "unused".to_owned(),
        expires_at: 0,
    });

    let mut rng = broker_crypto::rng::TestRng::from_u64(11);
    let session = Session::new(
        &mut rng,
        "alice@EXAMPLE.COM".to_owned(),
        "yarn@FOO.BAR".to_owned(),
        "gs://example".to_owned(),
        SCOPE.to_owned(),
        lifetime(),
    );
    services
        .sessions
        .save(&session.id, session.clone())
        .await
        .unwrap();
    let token = codec::encode(services.kms.as_ref(), &session);

    let mut rotated = session.clone();
    rotated.password = Secret::new("a-different-password".to_owned());
    let rotated_id = rotated.id.clone();
    services
        .sessions
        .save(&rotated_id, rotated)
        .await
        .unwrap();

    let (status, body) = post(
        &services,
        "GetAccessToken",
        Some(&format!("BrokerSession {token}")),
        json!({ "owner": "alice@EXAMPLE.COM", "scope": SCOPE, "target": "gs://example" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid session token");
}

#[tokio::test]
async fn get_access_token_rejects_scope_outside_the_whitelist() {
    let services = services(AccessToken {
        value: "unused".to_owned(),
        expires_at: 0,
    });

    let (status, body) = post(
        &services,
        "GetAccessToken",
        Some(&negotiate_header("alice@EXAMPLE.COM")),
        json!({
            "owner": "alice@EXAMPLE.COM",
            "scope": "https://www.googleapis.com/auth/compute",
            "target": "",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["message"],
        "`https://www.googleapis.com/auth/compute` is not a whitelisted scope"
    );
}

#[tokio::test]
async fn concurrent_get_access_token_calls_share_one_mint() {
    let services = services(AccessToken {
        value: "shared-token".to_owned(),
        expires_at: 999_999,
    });

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let services = services.clone();
            tokio::spawn(async move {
                post(
                    &services,
                    "GetAccessToken",
                    Some(&negotiate_header("alice@EXAMPLE.COM")),
                    json!({ "owner": "alice@EXAMPLE.COM", "scope": SCOPE, "target": "" }),
                )
                .await
            })
        })
        .collect();

    for call in calls {
        let (status, body) = call.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["access_token"], "shared-token");
    }
}

#[tokio::test]
async fn get_session_token_requires_a_negotiate_header() {
    let services = services(AccessToken {
        value: "unused".to_owned(),
        expires_at: 0,
    });

    let (status, body) = post(
        &services,
        "GetSessionToken",
        None,
        json!({
            "owner": "alice@EXAMPLE.COM",
            "renewer": "yarn@FOO.BAR",
            "target": "gs://example",
            "scope": SCOPE,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        body["message"],
        "Use \"authorization: Negotiate <token>\" metadata to authenticate"
    );
}
