//! The authenticator (C4): resolve a caller's identity from request
//! metadata, either via a negotiated GSSAPI/SPNEGO context or a presented
//! session token.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use broker_crypto::kms::Kms;

use crate::codec;
use crate::error::BrokerError;
use crate::session::{RecordStore, Session};

/// Isolates the platform GSSAPI bindings from the rest of the authenticator
/// so tests can substitute a fake acceptor that completes immediately with a
/// configured principal, without linking a real Kerberos library.
pub trait GssapiAcceptor: Send + Sync {
    /// Process one step of GSS accept-security-context against the given
    /// service principal (`service@hostname`) and the client-supplied
    /// SPNEGO token. Returns the authenticated client principal on success.
    fn accept(
        &self,
        service_principal: &str,
        spnego_token: &[u8],
    ) -> Result<String, GssapiError>;
}

#[derive(Clone, Debug, Error)]
pub enum GssapiError {
    #[error("GSSAPI context initialization failed")]
    InitFailed,
    #[error("GSSAPI accept-security-context step did not complete")]
    StepIncomplete,
    #[error("GSSAPI error: {0}")]
    Gss(String),
}

/// A [`GssapiAcceptor`] that completes immediately with a fixed principal,
/// treating the SPNEGO token bytes as the principal name itself. Used by
/// the integration test suite in place of a real Kerberos KDC.
#[cfg(any(test, feature = "test-utils"))]
pub struct FakeGssapiAcceptor;

#[cfg(any(test, feature = "test-utils"))]
impl GssapiAcceptor for FakeGssapiAcceptor {
    fn accept(
        &self,
        _service_principal: &str,
        spnego_token: &[u8],
    ) -> Result<String, GssapiError> {
        String::from_utf8(spnego_token.to_vec())
            .map_err(|_| GssapiError::Gss("token is not a valid principal".to_owned()))
    }
}

/// The production [`GssapiAcceptor`], backed by the system GSSAPI library via
/// `libgssapi`. Acquires acceptor credentials for the given service principal
/// (from the keytab named by `KRB5_KTNAME`/the system default) and runs one
/// step of `accept_sec_context`, matching the single-shot negotiation this
/// authenticator performs per call.
#[cfg(feature = "gssapi")]
pub struct LibGssapiAcceptor;

#[cfg(feature = "gssapi")]
impl GssapiAcceptor for LibGssapiAcceptor {
    fn accept(
        &self,
        service_principal: &str,
        spnego_token: &[u8],
    ) -> Result<String, GssapiError> {
        use libgssapi::{
            context::{SecurityContext, ServerCtx},
            credential::{Cred, CredUsage},
            name::Name,
            oid::{OidSet, GSS_MECH_KRB5, GSS_NT_HOSTBASED_SERVICE},
        };

        let name = Name::new(service_principal.as_bytes(), Some(&GSS_NT_HOSTBASED_SERVICE))
            .map_err(|e| GssapiError::Gss(e.to_string()))?;
        let mut mechs = OidSet::new().map_err(|e| GssapiError::Gss(e.to_string()))?;
        mechs
            .add(&GSS_MECH_KRB5)
            .map_err(|e| GssapiError::Gss(e.to_string()))?;
        let cred = Cred::acquire(Some(&name), None, CredUsage::Accept, Some(&mechs))
            .map_err(|_| GssapiError::InitFailed)?;

        let mut ctx = ServerCtx::new(cred);
        ctx.step(spnego_token)
            .map_err(|e| GssapiError::Gss(e.to_string()))?;
        if !ctx.is_complete() {
            return Err(GssapiError::StepIncomplete);
        }
        ctx.source_name()
            .map(|name| name.to_string())
            .map_err(|e| GssapiError::Gss(e.to_string()))
        // `ctx` (and the GSS context it owns) is destroyed here on every exit
        // path, satisfying the "destroyed on every exit path" requirement.
    }
}

/// Authenticates a caller via a negotiated GSSAPI/SPNEGO context, keyed off
/// the `authorization: Negotiate <base64-token>` header.
pub struct KerberosAuthenticator {
    acceptor: Box<dyn GssapiAcceptor>,
    service_name: String,
    service_hostname: String,
}

impl KerberosAuthenticator {
    pub fn new(
        acceptor: Box<dyn GssapiAcceptor>,
        service_name: String,
        service_hostname: String,
    ) -> Self {
        Self {
            acceptor,
            service_name,
            service_hostname,
        }
    }

    /// Resolve the calling principal from the `authorization` header. Fails
    /// with `Unauthenticated` if the header is absent or malformed, and
    /// `PermissionDenied` for any GSSAPI-level rejection.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<String, BrokerError> {
        let spnego_b64 = extract_negotiate_token(authorization)?;
        let spnego_token = STANDARD.decode(spnego_b64).map_err(|_| {
            BrokerError::permission_denied("Malformed SPNEGO token")
        })?;

        let service_principal = format!("{}@{}", self.service_name, self.service_hostname);
        self.acceptor
            .accept(&service_principal, &spnego_token)
            .map_err(|_| BrokerError::permission_denied("GSSAPI authentication failed"))
    }
}

const UNAUTHENTICATED_MSG: &str =
    "Use \"authorization: Negotiate <token>\" metadata to authenticate";

fn extract_negotiate_token(authorization: Option<&str>) -> Result<&str, BrokerError> {
    let header = authorization.ok_or_else(|| BrokerError::unauthenticated(UNAUTHENTICATED_MSG))?;
    header
        .strip_prefix("Negotiate ")
        .ok_or_else(|| BrokerError::unauthenticated(UNAUTHENTICATED_MSG))
}

/// Load and verify the session named by a `BrokerSession <token>` header.
/// Returns `Ok(None)` if the header is absent or carries a different
/// scheme, so the caller can fall back to the Kerberos path.
pub async fn authenticate_session(
    authorization: Option<&str>,
    kms: &dyn Kms,
    store: &dyn RecordStore<Session>,
) -> Result<Option<Session>, BrokerError> {
    let Some(header) = authorization else {
        return Ok(None);
    };
    let Some(token) = header.strip_prefix("BrokerSession ") else {
        return Ok(None);
    };

    let session = get_session_from_token(token, kms, store).await?;
    if session.is_expired() {
        // Preserved bug-compatibility: the source reports this as
        // `Unimplemented` rather than `PermissionDenied`. See DESIGN.md.
        return Err(BrokerError::unimplemented(format!(
            "Expired session ID: {}",
            session.id
        )));
    }
    Ok(Some(session))
}

/// Decode a session token, load the named session, and verify its password.
/// Any failure (malformed token, unknown session, password mismatch)
/// collapses to the same `Unauthenticated("Invalid session token")`, so a
/// client cannot distinguish "no such session" from "wrong password".
pub async fn get_session_from_token(
    token: &str,
    kms: &dyn Kms,
    store: &dyn RecordStore<Session>,
) -> Result<Session, BrokerError> {
    let invalid = || BrokerError::unauthenticated("Invalid session token");

    let (session_id, ciphertext) = codec::decode(token)?;
    let session = store.get(&session_id).await.map_err(|_| invalid())?;
    if !codec::verify(kms, &session, ciphertext) {
        return Err(invalid());
    }
    Ok(session)
}

/// When an authenticated principal requests access on behalf of a different
/// `owner`, the principal must appear in `PROXY_USER_WHITELIST`.
pub fn check_impersonation(
    authenticated_user: &str,
    owner: &str,
    proxy_user_whitelist: &[String],
) -> Result<(), BrokerError> {
    if authenticated_user != owner
        && !proxy_user_whitelist.iter().any(|p| p == authenticated_user)
    {
        return Err(BrokerError::permission_denied(format!(
            "`{authenticated_user}` is not a whitelisted impersonator"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use broker_crypto::{kms::DevKms, rng::TestRng};

    use super::*;
    use crate::session::{InMemoryRecordStore, SessionLifetime};

    fn lifetime() -> SessionLifetime {
        SessionLifetime {
            renew_period_ms: 24 * 3_600 * 1_000,
            maximum_lifetime_ms: 7 * 24 * 3_600 * 1_000,
        }
    }

    #[test]
    fn kerberos_requires_negotiate_header() {
        let auth = KerberosAuthenticator::new(
            Box::new(FakeGssapiAcceptor),
            "broker".to_owned(),
            "broker.example.com".to_owned(),
        );
        let err = auth.authenticate(None).unwrap_err();
        assert_eq!(err.message, UNAUTHENTICATED_MSG);
    }

    #[test]
    fn kerberos_accepts_negotiate_header() {
        let auth = KerberosAuthenticator::new(
            Box::new(FakeGssapiAcceptor),
            "broker".to_owned(),
            "broker.example.com".to_owned(),
        );
        let token = STANDARD.encode(b"alice@EXAMPLE.COM");
        let header = format!("Negotiate {token}");
        let principal = auth.authenticate(Some(&header)).unwrap();
        assert_eq!(principal, "alice@EXAMPLE.COM");
    }

    #[tokio::test]
    async fn session_auth_roundtrip() {
        let kms = DevKms::new(&[1u8; 32], &[2u8; 32], &[3u8; 32]);
        let store: InMemoryRecordStore<Session> = InMemoryRecordStore::new();
        let mut rng = TestRng::from_u64(3);
        let session = Session::new(
            &mut rng,
            "alice@EXAMPLE.COM".to_owned(),
            "yarn@FOO.BAR".to_owned(),
            "gs://example".to_owned(),
            "scope".to_owned(),
            lifetime(),
        );
        store.save(&session.id, session.clone()).await.unwrap();
        let token = codec::encode(&kms, &session);
        let header = format!("BrokerSession {token}");

        let resolved = authenticate_session(Some(&header), &kms, &store)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.owner, "alice@EXAMPLE.COM");
    }

    #[tokio::test]
    async fn session_auth_absent_header_falls_through() {
        let kms = DevKms::new(&[1u8; 32], &[2u8; 32], &[3u8; 32]);
        let store: InMemoryRecordStore<Session> = InMemoryRecordStore::new();
        assert!(authenticate_session(None, &kms, &store).await.unwrap().is_none());
    }

    #[test]
    fn impersonation_requires_whitelist() {
        let whitelist = vec!["admin@EXAMPLE.COM".to_owned()];
        assert!(check_impersonation("alice@EXAMPLE.COM", "alice@EXAMPLE.COM", &whitelist).is_ok());
        assert!(check_impersonation("admin@EXAMPLE.COM", "alice@EXAMPLE.COM", &whitelist).is_ok());
        assert!(check_impersonation("mallory@EXAMPLE.COM", "alice@EXAMPLE.COM", &whitelist).is_err());
    }
}
