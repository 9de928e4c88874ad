//! The broker's key-management contract: `Encrypt(key_id, plaintext)` /
//! `Decrypt(key_id, ciphertext)`, delegated to an external KMS in production.
//!
//! The core owns three independently-rotatable named keys so leaking one
//! doesn't compromise the others: the refresh-token key, the access-token
//! cache key, and the session delegation-secret key.

use std::fmt;

use thiserror::Error;

use crate::{
    aes::{self, AesMasterKey},
    rng::SysRng,
};

/// One of the broker's three named KMS keys.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BrokerKey {
    /// Encrypts persisted [`RefreshToken`](crate) ciphertext.
    RefreshToken,
    /// Encrypts the JSON-encoded `AccessToken` stored in the L2 cache.
    AccessTokenCache,
    /// Encrypts the session `password` embedded in a session token.
    DelegationSecret,
}

impl BrokerKey {
    pub const ALL: [BrokerKey; 3] = [
        BrokerKey::RefreshToken,
        BrokerKey::AccessTokenCache,
        BrokerKey::DelegationSecret,
    ];
}

impl fmt::Display for BrokerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RefreshToken => "refresh-token",
            Self::AccessTokenCache => "access-token-cache",
            Self::DelegationSecret => "delegation-secret",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("kms decrypt failed for key `{key}`: ciphertext or metadata may be corrupted")]
pub struct KmsDecryptError {
    key: BrokerKey,
}

/// The broker's view of a key-management service. Production deployments
/// implement this against a real cloud KMS; [`DevKms`] below is the
/// local-development / test stand-in.
pub trait Kms: Send + Sync {
    fn encrypt(&self, key: BrokerKey, plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(
        &self,
        key: BrokerKey,
        ciphertext: Vec<u8>,
    ) -> Result<Vec<u8>, KmsDecryptError>;
}

/// A [`Kms`] backed by three local [`AesMasterKey`]s, one per [`BrokerKey`].
/// Used for local development and the integration test suite in lieu of a
/// real cloud KMS client, which this crate deliberately has no dependency on.
pub struct DevKms {
    refresh_token: AesMasterKey,
    access_token_cache: AesMasterKey,
    delegation_secret: AesMasterKey,
    rng: std::sync::Mutex<SysRng>,
}

impl DevKms {
    /// Derive the three named master keys from independent 32-byte seeds.
    /// Callers typically obtain these seeds by decoding the
    /// `ENCRYPTION_*_CRYPTO_KEY` configuration values (see the server crate).
    pub fn new(
        refresh_token_seed: &[u8; 32],
        access_token_cache_seed: &[u8; 32],
        delegation_secret_seed: &[u8; 32],
    ) -> Self {
        Self {
            refresh_token: AesMasterKey::new(refresh_token_seed),
            access_token_cache: AesMasterKey::new(access_token_cache_seed),
            delegation_secret: AesMasterKey::new(delegation_secret_seed),
            rng: std::sync::Mutex::new(SysRng::new()),
        }
    }

    fn master_key(&self, key: BrokerKey) -> &AesMasterKey {
        match key {
            BrokerKey::RefreshToken => &self.refresh_token,
            BrokerKey::AccessTokenCache => &self.access_token_cache,
            BrokerKey::DelegationSecret => &self.delegation_secret,
        }
    }

}

impl Kms for DevKms {
    fn encrypt(&self, key: BrokerKey, plaintext: &[u8]) -> Vec<u8> {
        let key_str = key.to_string();
        let aad: &[&[u8]] = &[key_str.as_bytes()];
        let mut rng = self.rng.lock().expect("rng mutex poisoned");
        self.master_key(key).encrypt(&mut *rng, aad, plaintext)
    }

    fn decrypt(
        &self,
        key: BrokerKey,
        ciphertext: Vec<u8>,
    ) -> Result<Vec<u8>, KmsDecryptError> {
        let key_str = key.to_string();
        let aad: &[&[u8]] = &[key_str.as_bytes()];
        self.master_key(key)
            .decrypt(aad, ciphertext)
            .map_err(|aes::DecryptError| KmsDecryptError { key })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_kms() -> DevKms {
        DevKms::new(&[1u8; 32], &[2u8; 32], &[3u8; 32])
    }

    #[test]
    fn roundtrips_per_key() {
        let kms = test_kms();
        for key in BrokerKey::ALL {
            let ciphertext = kms.encrypt(key, b"hello");
            let plaintext = kms.decrypt(key, ciphertext).unwrap();
            assert_eq!(plaintext, b"hello");
        }
    }

    #[test]
    fn keys_are_isolated() {
        let kms = test_kms();
        let ciphertext = kms.encrypt(BrokerKey::RefreshToken, b"hello");
        // Decrypting under a different named key must fail: each key has its
        // own HKDF-derived subkey, and the AAD binds the key name too.
        assert!(kms.decrypt(BrokerKey::AccessTokenCache, ciphertext).is_err());
    }
}
