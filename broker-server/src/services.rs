//! The `Services` bundle: every backend the endpoint handlers need, built
//! once from [`Config`] at startup and handed to the router as shared state.

use std::sync::Arc;

use broker_core::{
    auth::{GssapiAcceptor, GssapiError, KerberosAuthenticator},
    cache::{Cache, CacheTtls, InMemoryCache, InMemoryL2Cache},
    provider::{
        GoogleMetadataJwtSigner, IdentityMapper, Provider, RefreshTokenProvider, SignedJwtProvider,
    },
    session::{InMemoryRecordStore, RecordStore, RefreshToken, Session, SessionLifetime},
};
use broker_crypto::kms::{DevKms, Kms};

use crate::config::{Config, ProviderBackend};

/// Returned by [`GssapiAcceptor::accept`] when the server was built without
/// the `gssapi` feature, so `AUTH_BACKEND=kerberos` still resolves to
/// *something* rather than a missing symbol.
struct UnsupportedGssapiAcceptor;

impl GssapiAcceptor for UnsupportedGssapiAcceptor {
    fn accept(&self, _service_principal: &str, _spnego_token: &[u8]) -> Result<String, GssapiError> {
        Err(GssapiError::Gss(
            "this binary was built without the `gssapi` feature; rebuild with \
             `--features broker-core/gssapi` on a host with a system Kerberos install"
                .to_owned(),
        ))
    }
}

fn build_acceptor(config: &Config) -> Box<dyn GssapiAcceptor> {
    #[cfg(feature = "gssapi")]
    {
        let _ = &config.keytab_path;
        if let Some(path) = &config.keytab_path {
            // libgssapi reads the acceptor keytab from this well-known env
            // var rather than taking a path directly.
            std::env::set_var("KRB5_KTNAME", path);
        }
        Box::new(broker_core::auth::LibGssapiAcceptor)
    }
    #[cfg(not(feature = "gssapi"))]
    {
        let _ = config;
        Box::new(UnsupportedGssapiAcceptor)
    }
}

fn build_provider(config: &Config, http: reqwest::Client) -> Box<dyn Provider> {
    match config.provider_backend {
        // Unused by `ShadowServiceAccount` mode: the JWT issuer there is
        // always the mapped shadow account, never `broker_service_account`.
        ProviderBackend::Shadow => Box::new(SignedJwtProvider::new(
            Box::new(GoogleMetadataJwtSigner::new(http.clone())),
            http,
            IdentityMapper::ShadowServiceAccount {
                shadow_project: config.shadow_project.clone(),
            },
            config.broker_service_account.clone(),
            config.jwt_life_secs,
        )),
        ProviderBackend::DomainWideDelegation => Box::new(SignedJwtProvider::new(
            Box::new(GoogleMetadataJwtSigner::new(http.clone())),
            http,
            IdentityMapper::DomainWideDelegation {
                domain_name: config.domain_name.clone(),
            },
            config.broker_service_account.clone(),
            config.jwt_life_secs,
        )),
        ProviderBackend::Refresh => Box::new(RefreshTokenProvider::new(
            http,
            Arc::new(DevKms::new(
                &config.refresh_token_key_seed,
                &config.access_token_cache_key_seed,
                &config.delegation_key_seed,
            )) as Arc<dyn Kms>,
            Arc::new(InMemoryRecordStore::<RefreshToken>::new()) as Arc<dyn RecordStore<RefreshToken>>,
            config.domain_name.clone(),
            config.oauth_client_id.clone(),
            config.oauth_client_secret.clone(),
        )),
    }
}

/// Everything an endpoint handler needs, constructed once and shared (via
/// `Arc`, through axum's `State` extractor) across every request.
pub struct Services {
    pub sessions: Arc<dyn RecordStore<Session>>,
    pub kms: Arc<dyn Kms>,
    pub l1_cache: InMemoryCache,
    pub l2_cache: Arc<dyn Cache>,
    pub cache_ttls: CacheTtls,
    pub kerberos: KerberosAuthenticator,
    pub provider: Box<dyn Provider>,
    pub session_lifetime: SessionLifetime,
    pub scope_whitelist: Vec<String>,
    pub proxy_user_whitelist: Vec<String>,
}

impl Services {
    pub fn build(config: &Config) -> Self {
        let http = reqwest::Client::new();
        let kms = Arc::new(DevKms::new(
            &config.refresh_token_key_seed,
            &config.access_token_cache_key_seed,
            &config.delegation_key_seed,
        )) as Arc<dyn Kms>;

        Self {
            sessions: Arc::new(InMemoryRecordStore::<Session>::new()),
            kms,
            l1_cache: InMemoryCache::new(),
            l2_cache: Arc::new(InMemoryL2Cache::new()),
            cache_ttls: CacheTtls {
                local_secs: config.access_token_local_cache_time_secs,
                remote_secs: config.access_token_remote_cache_time_secs,
            },
            kerberos: KerberosAuthenticator::new(
                build_acceptor(config),
                config.broker_service_name.clone(),
                config.broker_service_hostname.clone(),
            ),
            provider: build_provider(config, http),
            session_lifetime: config.session_lifetime,
            scope_whitelist: config.scope_whitelist.clone(),
            proxy_user_whitelist: config.proxy_user_whitelist.clone(),
        }
    }
}
