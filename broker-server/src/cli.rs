//! Command-line / environment configuration surface.
//!
//! Every setting is `Option<T>` on the CLI struct: a flag takes precedence,
//! then its `APP_SETTING_<NAME>` environment variable, then the hardcoded
//! default in [`crate::config::Config::resolve`]. Mirrors the corpus's own
//! binaries (`--flag` then `or_env_mut` then a constant).

use std::{net::SocketAddr, str::FromStr};

use crate::or_env::OrEnvExt as _;

/// A comma-separated list, e.g. `PROXY_USER_WHITELIST=admin@FOO.BAR,ops@FOO.BAR`.
#[derive(Clone, Debug, Default)]
pub struct CommaList(pub Vec<String>);

impl FromStr for CommaList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}

/// A 32-byte KMS key seed, hex-encoded on the command line / in env.
#[derive(Clone, Copy)]
pub struct HexKey32(pub [u8; 32]);

impl FromStr for HexKey32 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = broker_crypto::hex::decode(s).map_err(|e| anyhow::anyhow!("{e}"))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("key must be exactly 32 bytes"))?;
        Ok(Self(array))
    }
}

impl std::fmt::Debug for HexKey32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HexKey32(..)")
    }
}

/// The token broker server.
#[derive(Debug, argh::FromArgs)]
pub struct Args {
    /// the `<ip-address:port>` to listen on.
    /// Env: `APP_SETTING_SERVER_HOST` / `APP_SETTING_SERVER_PORT`.
    #[argh(option)]
    pub listen_addr: Option<SocketAddr>,

    /// size of the tokio worker-thread pool. Default: 10.
    /// Env: `APP_SETTING_NUM_SERVER_THREADS`.
    #[argh(option)]
    pub num_server_threads: Option<usize>,

    /// path to a PEM-encoded TLS private key. Accepted for interface parity
    /// with the source config surface; TLS termination is out of scope (see
    /// `DESIGN.md`), so this is currently unused.
    /// Env: `APP_SETTING_TLS_KEY_PATH`.
    #[argh(option)]
    pub tls_key_path: Option<String>,

    /// path to a PEM-encoded TLS certificate. See `tls_key_path`.
    /// Env: `APP_SETTING_TLS_CRT_PATH`.
    #[argh(option)]
    pub tls_crt_path: Option<String>,

    /// path to the Kerberos keytab the GSSAPI acceptor authenticates with.
    /// Only consulted when built with the `gssapi` feature.
    /// Env: `APP_SETTING_KEYTAB_PATH`.
    #[argh(option)]
    pub keytab_path: Option<String>,

    /// which authenticator backend to use. Only `kerberos` is a real
    /// production backend; default: `kerberos`.
    /// Env: `APP_SETTING_AUTH_BACKEND`.
    #[argh(option)]
    pub auth_backend: Option<String>,

    /// which access-token cache backend to use. Default: `in-memory`.
    /// Env: `APP_SETTING_CACHE_BACKEND`.
    #[argh(option)]
    pub cache_backend: Option<String>,

    /// which record-store backend to use. Default: `in-memory`.
    /// Env: `APP_SETTING_DATABASE_BACKEND`.
    #[argh(option)]
    pub database_backend: Option<String>,

    /// which logging sink to use. Default: `stdout`.
    /// Env: `APP_SETTING_LOGGING_BACKEND`.
    #[argh(option)]
    pub logging_backend: Option<String>,

    /// the Kerberos realm of accepted clients.
    /// Env: `APP_SETTING_ORIGIN_REALM`.
    #[argh(option)]
    pub origin_realm: Option<String>,

    /// the GSSAPI service principal's short name, e.g. `broker`.
    /// Env: `APP_SETTING_BROKER_SERVICE_NAME`.
    #[argh(option)]
    pub broker_service_name: Option<String>,

    /// the GSSAPI service principal's hostname.
    /// Env: `APP_SETTING_BROKER_SERVICE_HOSTNAME`.
    #[argh(option)]
    pub broker_service_hostname: Option<String>,

    /// the cloud-domain suffix used to map Kerberos identities to cloud
    /// identities, e.g. `example.com`.
    /// Env: `APP_SETTING_DOMAIN_NAME`.
    #[argh(option)]
    pub domain_name: Option<String>,

    /// comma-separated allowed OAuth scopes.
    /// Env: `APP_SETTING_SCOPE_WHITELIST`.
    #[argh(option)]
    pub scope_whitelist: Option<CommaList>,

    /// comma-separated principals allowed to impersonate another owner.
    /// Env: `APP_SETTING_PROXY_USER_WHITELIST`.
    #[argh(option)]
    pub proxy_user_whitelist: Option<CommaList>,

    /// the cloud project hosting shadow service accounts.
    /// Env: `APP_SETTING_SHADOW_PROJECT`.
    #[argh(option)]
    pub shadow_project: Option<String>,

    /// the broker's own service account email, used as the signed JWT
    /// issuer under domain-wide delegation. Required when
    /// `PROVIDER_BACKEND=dwd`.
    /// Env: `APP_SETTING_BROKER_SERVICE_ACCOUNT`.
    #[argh(option)]
    pub broker_service_account: Option<String>,

    /// which provider mints access tokens: `shadow`, `dwd`, or `refresh`.
    /// Env: `APP_SETTING_PROVIDER_BACKEND`.
    #[argh(option)]
    pub provider_backend: Option<String>,

    /// signed-JWT lifetime, in seconds. Default: 30.
    /// Env: `APP_SETTING_JWT_LIFE`.
    #[argh(option)]
    pub jwt_life_secs: Option<u64>,

    /// maximum session lifetime, in milliseconds. Default: 7 days.
    /// Env: `APP_SETTING_SESSION_MAXIMUM_LIFETIME`.
    #[argh(option)]
    pub session_maximum_lifetime_ms: Option<u64>,

    /// the session lifetime granted per renewal, in milliseconds.
    /// Default: 24 hours.
    /// Env: `APP_SETTING_SESSION_RENEW_PERIOD`.
    #[argh(option)]
    pub session_renew_period_ms: Option<u64>,

    /// remote (L2) access-token cache TTL, in seconds. Default: 1800.
    /// Env: `APP_SETTING_ACCESS_TOKEN_REMOTE_CACHE_TIME`.
    #[argh(option)]
    pub access_token_remote_cache_time_secs: Option<u64>,

    /// local (L1) access-token cache TTL, in seconds. Default: 60.
    /// Env: `APP_SETTING_ACCESS_TOKEN_LOCAL_CACHE_TIME`.
    #[argh(option)]
    pub access_token_local_cache_time_secs: Option<u64>,

    /// 32-byte hex-encoded seed for the refresh-token KMS key.
    /// Env: `APP_SETTING_ENCRYPTION_REFRESH_TOKEN_CRYPTO_KEY`.
    #[argh(option)]
    pub encryption_refresh_token_crypto_key: Option<HexKey32>,

    /// 32-byte hex-encoded seed for the access-token-cache KMS key.
    /// Env: `APP_SETTING_ENCRYPTION_ACCESS_TOKEN_CRYPTO_KEY`.
    #[argh(option)]
    pub encryption_access_token_crypto_key: Option<HexKey32>,

    /// 32-byte hex-encoded seed for the session delegation-secret KMS key.
    /// Env: `APP_SETTING_ENCRYPTION_DELEGATION_CRYPTO_KEY`.
    #[argh(option)]
    pub encryption_delegation_crypto_key: Option<HexKey32>,

    /// OAuth2 client id, used by the refresh-token provider.
    /// Env: `APP_SETTING_OAUTH_CLIENT_ID`.
    #[argh(option)]
    pub oauth_client_id: Option<String>,

    /// OAuth2 client secret, used by the refresh-token provider.
    /// Env: `APP_SETTING_OAUTH_CLIENT_SECRET`.
    #[argh(option)]
    pub oauth_client_secret: Option<String>,
}

impl Args {
    /// Parse from `env::args()`, then fill unset fields from their
    /// `APP_SETTING_<NAME>` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut args: Self = argh::from_env();

        args.listen_addr
            .or_env_mut("APP_SETTING_LISTEN_ADDR")?;
        args.num_server_threads
            .or_env_mut("APP_SETTING_NUM_SERVER_THREADS")?;
        args.tls_key_path.or_env_mut("APP_SETTING_TLS_KEY_PATH")?;
        args.tls_crt_path.or_env_mut("APP_SETTING_TLS_CRT_PATH")?;
        args.keytab_path.or_env_mut("APP_SETTING_KEYTAB_PATH")?;
        args.auth_backend.or_env_mut("APP_SETTING_AUTH_BACKEND")?;
        args.cache_backend.or_env_mut("APP_SETTING_CACHE_BACKEND")?;
        args.database_backend
            .or_env_mut("APP_SETTING_DATABASE_BACKEND")?;
        args.logging_backend
            .or_env_mut("APP_SETTING_LOGGING_BACKEND")?;
        args.origin_realm.or_env_mut("APP_SETTING_ORIGIN_REALM")?;
        args.broker_service_name
            .or_env_mut("APP_SETTING_BROKER_SERVICE_NAME")?;
        args.broker_service_hostname
            .or_env_mut("APP_SETTING_BROKER_SERVICE_HOSTNAME")?;
        args.domain_name.or_env_mut("APP_SETTING_DOMAIN_NAME")?;
        args.scope_whitelist
            .or_env_mut("APP_SETTING_SCOPE_WHITELIST")?;
        args.proxy_user_whitelist
            .or_env_mut("APP_SETTING_PROXY_USER_WHITELIST")?;
        args.shadow_project
            .or_env_mut("APP_SETTING_SHADOW_PROJECT")?;
        args.broker_service_account
            .or_env_mut("APP_SETTING_BROKER_SERVICE_ACCOUNT")?;
        args.provider_backend
            .or_env_mut("APP_SETTING_PROVIDER_BACKEND")?;
        args.jwt_life_secs.or_env_mut("APP_SETTING_JWT_LIFE")?;
        args.session_maximum_lifetime_ms
            .or_env_mut("APP_SETTING_SESSION_MAXIMUM_LIFETIME")?;
        args.session_renew_period_ms
            .or_env_mut("APP_SETTING_SESSION_RENEW_PERIOD")?;
        args.access_token_remote_cache_time_secs
            .or_env_mut("APP_SETTING_ACCESS_TOKEN_REMOTE_CACHE_TIME")?;
        args.access_token_local_cache_time_secs
            .or_env_mut("APP_SETTING_ACCESS_TOKEN_LOCAL_CACHE_TIME")?;
        args.encryption_refresh_token_crypto_key
            .or_env_mut("APP_SETTING_ENCRYPTION_REFRESH_TOKEN_CRYPTO_KEY")?;
        args.encryption_access_token_crypto_key
            .or_env_mut("APP_SETTING_ENCRYPTION_ACCESS_TOKEN_CRYPTO_KEY")?;
        args.encryption_delegation_crypto_key
            .or_env_mut("APP_SETTING_ENCRYPTION_DELEGATION_CRYPTO_KEY")?;
        args.oauth_client_id
            .or_env_mut("APP_SETTING_OAUTH_CLIENT_ID")?;
        args.oauth_client_secret
            .or_env_mut("APP_SETTING_OAUTH_CLIENT_SECRET")?;

        Ok(args)
    }
}
