//! OAuth2 access-token providers (C6): mint a fresh access token for an
//! owner/scope pair, either by trading a broker-signed JWT for one (shadow
//! service accounts and domain-wide delegation) or by redeeming a
//! previously-authorized refresh token.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use broker_crypto::{
    kms::{BrokerKey, Kms},
    ExposeSecret, Secret,
};

use crate::cache::AccessToken;
use crate::error::BrokerError;
use crate::session::{RecordStore, RefreshToken};

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    async fn mint_access_token(&self, owner: &str, scope: &str) -> Result<AccessToken, BrokerError>;
}

fn calculate_expiry_time(expires_in_secs: u64) -> u64 {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64;
    now_ms + expires_in_secs * 1_000
}

#[derive(Clone, Debug, Error)]
pub enum ProviderError {
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("token exchange failed: {0}")]
    Exchange(String),
}

impl From<ProviderError> for BrokerError {
    fn from(err: ProviderError) -> Self {
        tracing::error!(error = %err, "provider error");
        BrokerError::server_error()
    }
}

/// Isolates the call out to the IAM `signJwt` API (and the broker's own
/// service-account credentials, fetched from the metadata server) so tests
/// can substitute a signer that returns a fixed string without reaching the
/// network.
#[async_trait::async_trait]
pub trait JwtSigner: Send + Sync {
    /// Sign `claims` as `service_account` and return the signed JWT.
    async fn sign_jwt(
        &self,
        service_account: &str,
        claims: &serde_json::Value,
    ) -> Result<String, ProviderError>;
}

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";
const IAM_SIGN_JWT_URL: &str = "https://iam.googleapis.com/v1/projects/-/serviceAccounts";
const OAUTH_TOKEN_URL: &str = "https://www.googleapis.com/oauth2/v4/token";

/// Signs JWTs as the broker's own GCE/GKE service account, fetching its
/// identity and a bearer token from the local metadata server on each call.
pub struct GoogleMetadataJwtSigner {
    http: reqwest::Client,
}

impl GoogleMetadataJwtSigner {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn broker_service_account(&self) -> Result<(String, String), ProviderError> {
        let err = |e: reqwest::Error| ProviderError::Signing(e.to_string());

        let email = self
            .http
            .get(format!(
                "{METADATA_BASE}/instance/service-accounts/default/email"
            ))
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(err)?
            .text()
            .await
            .map_err(err)?;

        #[derive(Deserialize)]
        struct MetadataToken {
            access_token: String,
        }
        let token: MetadataToken = self
            .http
            .get(format!(
                "{METADATA_BASE}/instance/service-accounts/default/token"
            ))
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(err)?
            .json()
            .await
            .map_err(err)?;

        Ok((email, token.access_token))
    }
}

#[async_trait::async_trait]
impl JwtSigner for GoogleMetadataJwtSigner {
    async fn sign_jwt(
        &self,
        service_account: &str,
        claims: &serde_json::Value,
    ) -> Result<String, ProviderError> {
        let (_broker_email, broker_token) = self.broker_service_account().await?;
        let err = |e: reqwest::Error| ProviderError::Signing(e.to_string());

        #[derive(Deserialize)]
        struct SignJwtResponse {
            #[serde(rename = "signedJwt")]
            signed_jwt: Option<String>,
            error: Option<SignJwtError>,
        }
        #[derive(Deserialize)]
        struct SignJwtError {
            message: String,
        }

        let response: SignJwtResponse = self
            .http
            .post(format!("{IAM_SIGN_JWT_URL}/{service_account}:signJwt"))
            .bearer_auth(broker_token)
            .form(&[("payload", claims.to_string())])
            .send()
            .await
            .map_err(err)?
            .json()
            .await
            .map_err(err)?;

        if let Some(error) = response.error {
            return Err(ProviderError::Signing(error.message));
        }
        response
            .signed_jwt
            .ok_or_else(|| ProviderError::Signing("missing signedJwt in response".to_owned()))
    }
}

/// A [`JwtSigner`] that returns a fixed string, for use in the test suite.
#[cfg(any(test, feature = "test-utils"))]
pub struct FakeJwtSigner(pub String);

#[cfg(any(test, feature = "test-utils"))]
#[async_trait::async_trait]
impl JwtSigner for FakeJwtSigner {
    async fn sign_jwt(
        &self,
        _service_account: &str,
        _claims: &serde_json::Value,
    ) -> Result<String, ProviderError> {
        Ok(self.0.clone())
    }
}

/// Maps a broker owner identity (e.g. `alice@example.com`) onto the Google
/// identity a [`SignedJwtProvider`] mints on behalf of, and decides who the
/// signed JWT's issuer is.
#[derive(Clone, Debug)]
pub enum IdentityMapper {
    /// A shadow service account is a per-user service account the broker's
    /// own identity has been granted `roles/iam.serviceAccountTokenCreator`
    /// on; the JWT is self-issued by the shadow account.
    ShadowServiceAccount { shadow_project: String },
    /// Any user in the domain, impersonated via the broker's domain-wide
    /// delegation authority; the JWT is issued by the broker and delegated
    /// (`sub`) to the target user.
    DomainWideDelegation { domain_name: String },
}

impl IdentityMapper {
    fn google_identity(&self, identity: &str) -> String {
        let username = identity.split('@').next().unwrap_or(identity);
        match self {
            Self::ShadowServiceAccount { shadow_project } => {
                format!("{username}-shadow@{shadow_project}.iam.gserviceaccount.com")
            }
            Self::DomainWideDelegation { domain_name } => {
                format!("{username}@{domain_name}")
            }
        }
    }

    fn broker_issuer(&self) -> bool {
        matches!(self, Self::DomainWideDelegation { .. })
    }
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
    iss: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<&'a str>,
}

#[derive(Deserialize)]
struct OauthTokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Shared implementation for the JWT-bearer-grant providers: build and sign
/// a JWT for the mapped Google identity, then trade it for an access token.
pub struct SignedJwtProvider {
    signer: Box<dyn JwtSigner>,
    http: reqwest::Client,
    mapper: IdentityMapper,
    broker_service_account: String,
    jwt_lifetime_secs: u64,
}

impl SignedJwtProvider {
    pub fn new(
        signer: Box<dyn JwtSigner>,
        http: reqwest::Client,
        mapper: IdentityMapper,
        broker_service_account: String,
        jwt_lifetime_secs: u64,
    ) -> Self {
        Self {
            signer,
            http,
            mapper,
            broker_service_account,
            jwt_lifetime_secs,
        }
    }

    async fn trade_jwt_for_access_token(
        &self,
        signed_jwt: &str,
    ) -> Result<AccessToken, ProviderError> {
        let err = |e: reqwest::Error| ProviderError::Exchange(e.to_string());
        let response: OauthTokenResponse = self
            .http
            .post(OAUTH_TOKEN_URL)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", signed_jwt),
            ])
            .send()
            .await
            .map_err(err)?
            .json()
            .await
            .map_err(err)?;

        Ok(AccessToken {
            value: response.access_token,
            expires_at: calculate_expiry_time(response.expires_in),
        })
    }
}

#[async_trait::async_trait]
impl Provider for SignedJwtProvider {
    async fn mint_access_token(&self, owner: &str, scope: &str) -> Result<AccessToken, BrokerError> {
        let google_identity = self.mapper.google_identity(owner);
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_secs();

        let (iss, sub, signing_account) = if self.mapper.broker_issuer() {
            (
                self.broker_service_account.as_str(),
                Some(google_identity.as_str()),
                self.broker_service_account.as_str(),
            )
        } else {
            (google_identity.as_str(), None, google_identity.as_str())
        };

        let claims = JwtClaims {
            scope,
            aud: OAUTH_TOKEN_URL,
            iat: now_secs,
            exp: now_secs + self.jwt_lifetime_secs,
            iss,
            sub,
        };
        let claims = serde_json::to_value(&claims).expect("claims are always valid json");

        let signed_jwt = self.signer.sign_jwt(signing_account, &claims).await?;
        Ok(self.trade_jwt_for_access_token(&signed_jwt).await?)
    }
}

/// A [`Provider`] that returns a fixed [`AccessToken`] without touching the
/// network, standing in for a `SignedJwtProvider`+`RefreshTokenProvider`
/// trading a signed JWT or refresh token for a real one. Used by the
/// integration test suite in place of the OAuth2 token endpoint.
#[cfg(any(test, feature = "test-utils"))]
pub struct FakeProvider(pub AccessToken);

#[cfg(any(test, feature = "test-utils"))]
#[async_trait::async_trait]
impl Provider for FakeProvider {
    async fn mint_access_token(&self, _owner: &str, _scope: &str) -> Result<AccessToken, BrokerError> {
        Ok(self.0.clone())
    }
}

/// Redeems a previously-authorized refresh token on the user's behalf. The
/// refresh token is seeded out of band by a web consent flow this crate
/// doesn't implement and is stored encrypted at rest under
/// [`BrokerKey::RefreshToken`].
pub struct RefreshTokenProvider {
    http: reqwest::Client,
    kms: Arc<dyn Kms>,
    store: Arc<dyn RecordStore<RefreshToken>>,
    domain_name: String,
    client_id: String,
    client_secret: String,
}

impl RefreshTokenProvider {
    pub fn new(
        http: reqwest::Client,
        kms: Arc<dyn Kms>,
        store: Arc<dyn RecordStore<RefreshToken>>,
        domain_name: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            http,
            kms,
            store,
            domain_name,
            client_id,
            client_secret,
        }
    }

    fn google_identity(&self, identity: &str) -> String {
        let username = identity.split('@').next().unwrap_or(identity);
        format!("{username}@{}", self.domain_name)
    }

    fn authorization_error(owner: &str) -> BrokerError {
        BrokerError::permission_denied(format!(
            "GCP Token Broker authorization is invalid or has expired for user: {owner}"
        ))
    }
}

#[async_trait::async_trait]
impl Provider for RefreshTokenProvider {
    async fn mint_access_token(&self, owner: &str, scope: &str) -> Result<AccessToken, BrokerError> {
        let google_identity = self.google_identity(owner);

        let refresh_token = self
            .store
            .get(&google_identity)
            .await
            .map_err(|_| Self::authorization_error(owner))?;

        let decrypted = self
            .kms
            .decrypt(BrokerKey::RefreshToken, refresh_token.value)
            .map_err(|_| BrokerError::server_error())?;
        let refresh_token_value = Secret::new(
            String::from_utf8(decrypted).map_err(|_| BrokerError::server_error())?,
        );

        let response = self
            .http
            .post("https://oauth2.googleapis.com/token")
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token_value.expose_secret()),
                ("scope", scope),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Exchange(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::authorization_error(owner));
        }

        let body: OauthTokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Exchange(e.to_string()))?;

        Ok(AccessToken {
            value: body.access_token,
            expires_at: calculate_expiry_time(body.expires_in),
        })
    }
}

#[cfg(test)]
mod test {
    use broker_crypto::kms::DevKms;

    use super::*;
    use crate::session::InMemoryRecordStore;

    fn reqwest_client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[tokio::test]
    async fn shadow_service_account_maps_identity() {
        let provider = SignedJwtProvider::new(
            Box::new(FakeJwtSigner("signed".to_owned())),
            reqwest_client(),
            IdentityMapper::ShadowServiceAccount {
                shadow_project: "my-project".to_owned(),
            },
            "broker@my-project.iam.gserviceaccount.com".to_owned(),
            3_600,
        );
        let identity = provider.mapper.google_identity("alice@example.com");
        assert_eq!(
            identity,
            "alice-shadow@my-project.iam.gserviceaccount.com"
        );
        assert!(!provider.mapper.broker_issuer());
    }

    #[tokio::test]
    async fn domain_wide_delegation_is_broker_issued() {
        let mapper = IdentityMapper::DomainWideDelegation {
            domain_name: "example.com".to_owned(),
        };
        assert_eq!(mapper.google_identity("alice@other.org"), "alice@example.com");
        assert!(mapper.broker_issuer());
    }

    #[tokio::test]
    async fn refresh_token_provider_rejects_unknown_user() {
        let kms = Arc::new(DevKms::new(&[1u8; 32], &[2u8; 32], &[3u8; 32]));
        let store: Arc<dyn RecordStore<RefreshToken>> =
            Arc::new(InMemoryRecordStore::<RefreshToken>::new());
        let provider = RefreshTokenProvider::new(
            reqwest_client(),
            kms,
            store,
            "example.com".to_owned(),
            "client-id".to_owned(),
            "client-secret".to_owned(),
        );
        let err = provider
            .mint_access_token("nobody@example.com", "scope")
            .await
            .unwrap_err();
        assert!(err.message.contains("authorization is invalid"));
    }
}
