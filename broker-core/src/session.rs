//! The session record (C2): a durable binding of `(owner, renewer, target,
//! scope)` and a secret to an opaque id, plus the generic record store it's
//! layered on.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use broker_crypto::{
    rng::{Crng, RngExt},
    ExposeSecret, Secret,
};

/// Session lifetime ceilings, read from configuration (`SESSION_RENEW_PERIOD`
/// / `SESSION_MAXIMUM_LIFETIME`) and threaded through rather than read from a
/// global.
#[derive(Copy, Clone, Debug)]
pub struct SessionLifetime {
    pub renew_period_ms: u64,
    pub maximum_lifetime_ms: u64,
}

/// A persisted session: the broker's record of who may mint access tokens
/// under which scope/target, and who may renew or cancel the grant.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub password: Secret<String>,
    pub owner: String,
    pub renewer: String,
    pub target: String,
    pub scope: String,
    pub expires_at: u64,
    pub creation_time: u64,
}

// `Secret<String>` isn't `Clone` (secrecy avoids making needless copies of
// secret material harder to zeroize), so `Session` can't derive it either.
impl Clone for Session {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            password: Secret::new(self.password.expose_secret().clone()),
            owner: self.owner.clone(),
            renewer: self.renewer.clone(),
            target: self.target.clone(),
            scope: self.scope.clone(),
            expires_at: self.expires_at,
            creation_time: self.creation_time,
        }
    }
}

impl Session {
    /// Construct a brand new session: random id, random password, and an
    /// initial `expires_at` via [`Session::extend_lifetime`].
    pub fn new<R: Crng>(
        rng: &mut R,
        owner: String,
        renewer: String,
        target: String,
        scope: String,
        lifetime: SessionLifetime,
    ) -> Self {
        let now = now_ms();
        let mut session = Self {
            id: random_id(rng),
            password: random_password(rng),
            owner,
            renewer,
            target,
            scope,
            expires_at: 0,
            creation_time: now,
        };
        session.extend_lifetime(lifetime);
        session
    }

    /// `now + min(renew_period, maximum_lifetime)`. Called on creation and
    /// by `RenewSessionToken`.
    pub fn extend_lifetime(&mut self, lifetime: SessionLifetime) {
        let now = now_ms();
        let extension = lifetime.renew_period_ms.min(lifetime.maximum_lifetime_ms);
        self.expires_at = now + extension;
    }

    /// A session past its `expires_at` is treated as absent by
    /// authentication, even though it's still physically present in the
    /// store until cancelled or reaped.
    pub fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

fn random_id<R: Crng>(rng: &mut R) -> String {
    let bytes: [u8; 16] = rng.gen_bytes();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn random_password<R: Crng>(rng: &mut R) -> Secret<String> {
    // 24 raw bytes, url-safe base64 encoded, matching the source's
    // `secrets.token_urlsafe(24)`.
    let bytes: [u8; 24] = rng.gen_bytes();
    Secret::new(URL_SAFE_NO_PAD.encode(bytes))
}

/// A refresh-token record, seeded by the out-of-scope web consent flow and
/// read-only from the core's perspective.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshToken {
    /// The cloud-domain identity this refresh token was issued to, e.g.
    /// `alice@example.com`.
    pub id: String,
    /// Ciphertext of the refresh token under the refresh-token KMS key.
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Error)]
#[error("record not found: {0}")]
pub struct NotFound(pub String);

/// A minimal keyed persistence interface (§4.7's "record store"). Generic
/// over the stored record type so [`Session`] and [`RefreshToken`] share one
/// trait rather than hand-rolled CRUD per type.
#[async_trait::async_trait]
pub trait RecordStore<T>: Send + Sync {
    async fn save(&self, id: &str, record: T) -> Result<(), NotFound>;
    async fn get(&self, id: &str) -> Result<T, NotFound>;
    async fn delete(&self, id: &str) -> Result<(), NotFound>;
}

/// An in-memory [`RecordStore`], suitable for local development and the
/// integration test suite. Not durable across process restarts.
pub struct InMemoryRecordStore<T> {
    records: Mutex<HashMap<String, T>>,
}

impl<T> Default for InMemoryRecordStore<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> InMemoryRecordStore<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync> RecordStore<T> for InMemoryRecordStore<T> {
    async fn save(&self, id: &str, record: T) -> Result<(), NotFound> {
        self.records
            .lock()
            .expect("record store mutex poisoned")
            .insert(id.to_owned(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<T, NotFound> {
        self.records
            .lock()
            .expect("record store mutex poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| NotFound(id.to_owned()))
    }

    async fn delete(&self, id: &str) -> Result<(), NotFound> {
        self.records
            .lock()
            .expect("record store mutex poisoned")
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| NotFound(id.to_owned()))
    }
}

#[cfg(test)]
mod test {
    use broker_crypto::rng::TestRng;

    use super::*;

    fn lifetime() -> SessionLifetime {
        SessionLifetime {
            renew_period_ms: 24 * 3_600 * 1_000,
            maximum_lifetime_ms: 7 * 24 * 3_600 * 1_000,
        }
    }

    #[test]
    fn new_session_sets_id_password_and_expiry() {
        let mut rng = TestRng::from_u64(1);
        let session = Session::new(
            &mut rng,
            "alice@EXAMPLE.COM".to_owned(),
            "yarn@FOO.BAR".to_owned(),
            "gs://example".to_owned(),
            "scope".to_owned(),
            lifetime(),
        );
        assert!(!session.id.is_empty());
        assert!(!session.password.expose_secret().is_empty());
        assert!(!session.is_expired());
        assert_eq!(
            session.expires_at - session.creation_time,
            lifetime().renew_period_ms
        );
    }

    #[tokio::test]
    async fn in_memory_store_roundtrips() {
        let store: InMemoryRecordStore<Session> = InMemoryRecordStore::new();
        let mut rng = TestRng::from_u64(2);
        let session = Session::new(
            &mut rng,
            "alice@EXAMPLE.COM".to_owned(),
            "yarn@FOO.BAR".to_owned(),
            "gs://example".to_owned(),
            "scope".to_owned(),
            lifetime(),
        );
        store.save(&session.id, session.clone()).await.unwrap();
        let fetched = store.get(&session.id).await.unwrap();
        assert_eq!(fetched.owner, session.owner);

        store.delete(&session.id).await.unwrap();
        assert!(store.get(&session.id).await.is_err());
    }
}
