//! Resolves [`crate::cli::Args`] (all-optional, CLI-then-env) into a fully
//! populated, validated [`Config`] with the source service's defaults
//! applied.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{ensure, Context};
use broker_core::session::SessionLifetime;
use strum::EnumString;

use crate::cli::Args;

const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080));
const DEFAULT_NUM_SERVER_THREADS: usize = 10;
const DEFAULT_JWT_LIFE_SECS: u64 = 30;
const DEFAULT_SESSION_MAXIMUM_LIFETIME_MS: u64 = 7 * 24 * 3_600 * 1_000;
const DEFAULT_SESSION_RENEW_PERIOD_MS: u64 = 24 * 3_600 * 1_000;
const DEFAULT_ACCESS_TOKEN_REMOTE_CACHE_TIME_SECS: u64 = 1_800;
const DEFAULT_ACCESS_TOKEN_LOCAL_CACHE_TIME_SECS: u64 = 60;

/// The only backend this crate implements for each selector. Any other value
/// is rejected at startup rather than silently ignored.
fn require_backend(value: Option<&str>, setting: &str, only: &str) -> anyhow::Result<()> {
    let value = value.unwrap_or(only);
    ensure!(
        value == only,
        "APP_SETTING_{setting}=`{value}` is not supported; only `{only}` is implemented"
    );
    Ok(())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ProviderBackend {
    Shadow,
    #[strum(serialize = "dwd")]
    DomainWideDelegation,
    Refresh,
}

pub struct Config {
    pub listen_addr: SocketAddr,
    pub num_server_threads: usize,
    pub keytab_path: Option<String>,
    pub origin_realm: String,
    pub broker_service_name: String,
    pub broker_service_hostname: String,
    pub domain_name: String,
    pub scope_whitelist: Vec<String>,
    pub proxy_user_whitelist: Vec<String>,
    pub shadow_project: String,
    pub broker_service_account: String,
    pub provider_backend: ProviderBackend,
    pub jwt_life_secs: u64,
    pub session_lifetime: SessionLifetime,
    pub access_token_remote_cache_time_secs: u64,
    pub access_token_local_cache_time_secs: u64,
    pub refresh_token_key_seed: [u8; 32],
    pub access_token_cache_key_seed: [u8; 32],
    pub delegation_key_seed: [u8; 32],
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
}

impl Config {
    pub fn resolve(args: Args) -> anyhow::Result<Self> {
        let provider_backend = args
            .provider_backend
            .as_deref()
            .unwrap_or("shadow")
            .parse::<ProviderBackend>()?;

        let domain_name = args.domain_name.context("APP_SETTING_DOMAIN_NAME is required")?;
        let shadow_project = args.shadow_project.unwrap_or_default();
        if provider_backend == ProviderBackend::Shadow {
            ensure!(
                !shadow_project.is_empty(),
                "APP_SETTING_SHADOW_PROJECT is required when PROVIDER_BACKEND=shadow"
            );
        }

        let broker_service_account = args.broker_service_account.unwrap_or_default();
        if provider_backend == ProviderBackend::DomainWideDelegation {
            ensure!(
                !broker_service_account.is_empty(),
                "APP_SETTING_BROKER_SERVICE_ACCOUNT is required when PROVIDER_BACKEND=dwd"
            );
        }

        let oauth_client_id = args.oauth_client_id.unwrap_or_default();
        let oauth_client_secret = args.oauth_client_secret.unwrap_or_default();
        if provider_backend == ProviderBackend::Refresh {
            ensure!(
                !oauth_client_id.is_empty() && !oauth_client_secret.is_empty(),
                "APP_SETTING_OAUTH_CLIENT_ID and APP_SETTING_OAUTH_CLIENT_SECRET \
                 are required when PROVIDER_BACKEND=refresh"
            );
        }

        let scope_whitelist = args.scope_whitelist.unwrap_or_default().0;
        ensure!(
            !scope_whitelist.is_empty(),
            "APP_SETTING_SCOPE_WHITELIST must name at least one allowed scope"
        );

        require_backend(args.auth_backend.as_deref(), "AUTH_BACKEND", "kerberos")?;
        require_backend(args.cache_backend.as_deref(), "CACHE_BACKEND", "in-memory")?;
        require_backend(
            args.database_backend.as_deref(),
            "DATABASE_BACKEND",
            "in-memory",
        )?;
        require_backend(args.logging_backend.as_deref(), "LOGGING_BACKEND", "stdout")?;

        // TLS termination is out of scope for this transport (see
        // DESIGN.md); the paths are accepted for config-surface parity only.
        let _ = (args.tls_key_path, args.tls_crt_path);

        Ok(Self {
            listen_addr: args.listen_addr.unwrap_or(DEFAULT_LISTEN_ADDR),
            num_server_threads: args
                .num_server_threads
                .unwrap_or(DEFAULT_NUM_SERVER_THREADS),
            keytab_path: args.keytab_path,
            origin_realm: args
                .origin_realm
                .context("APP_SETTING_ORIGIN_REALM is required")?,
            broker_service_name: args
                .broker_service_name
                .context("APP_SETTING_BROKER_SERVICE_NAME is required")?,
            broker_service_hostname: args
                .broker_service_hostname
                .context("APP_SETTING_BROKER_SERVICE_HOSTNAME is required")?,
            domain_name,
            scope_whitelist,
            proxy_user_whitelist: args.proxy_user_whitelist.unwrap_or_default().0,
            shadow_project,
            broker_service_account,
            provider_backend,
            jwt_life_secs: args.jwt_life_secs.unwrap_or(DEFAULT_JWT_LIFE_SECS),
            session_lifetime: SessionLifetime {
                maximum_lifetime_ms: args
                    .session_maximum_lifetime_ms
                    .unwrap_or(DEFAULT_SESSION_MAXIMUM_LIFETIME_MS),
                renew_period_ms: args
                    .session_renew_period_ms
                    .unwrap_or(DEFAULT_SESSION_RENEW_PERIOD_MS),
            },
            access_token_remote_cache_time_secs: args
                .access_token_remote_cache_time_secs
                .unwrap_or(DEFAULT_ACCESS_TOKEN_REMOTE_CACHE_TIME_SECS),
            access_token_local_cache_time_secs: args
                .access_token_local_cache_time_secs
                .unwrap_or(DEFAULT_ACCESS_TOKEN_LOCAL_CACHE_TIME_SECS),
            refresh_token_key_seed: args
                .encryption_refresh_token_crypto_key
                .context("APP_SETTING_ENCRYPTION_REFRESH_TOKEN_CRYPTO_KEY is required")?
                .0,
            access_token_cache_key_seed: args
                .encryption_access_token_crypto_key
                .context("APP_SETTING_ENCRYPTION_ACCESS_TOKEN_CRYPTO_KEY is required")?
                .0,
            delegation_key_seed: args
                .encryption_delegation_crypto_key
                .context("APP_SETTING_ENCRYPTION_DELEGATION_CRYPTO_KEY is required")?
                .0,
            oauth_client_id,
            oauth_client_secret,
        })
    }
}
