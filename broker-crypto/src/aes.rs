//! Authenticated encryption of blobs under a long-term master key.
//!
//! ## Design
//!
//! This scheme is "Derive Key Mode", from
//! [(2017) GueronLindel](https://eprint.iacr.org/2017/702.pdf). A long-term
//! "master key" (see [`AesMasterKey`]) is never itself used to encrypt data;
//! instead it derives a fresh, single-use `EncryptKey`/`DecryptKey` per
//! message from a large random key id (see `KeyId`). Because each derived key
//! is used exactly once, an AES-256-GCM nonce of all zeroes is safe.
//!
//! ```text
//! Encrypt(master-key, aad: &[&[u8]], plaintext) :=
//! 1. version := 0_u8
//! 2. key-id := random 32-byte value
//! 3. aad' := bcs({ version, key-id, aad })
//! 4. encrypt-key := HKDF-Extract-Expand(
//!         ikm=master-key, salt=pad32("BROKER::AesMasterKey"),
//!         info=key-id, out-len=32 bytes,
//!    )
//! 5. (ciphertext, tag) := AES-256-GCM(encrypt-key, nonce=[0; 12], aad', plaintext)
//! 6. output := version || key-id || ciphertext || tag
//! ```
//!
//! This is the envelope used by [`crate::kms::DevKms`] to implement each of
//! the broker's three independently-rotatable named keys.

use std::fmt;

use broker_std::array;
use ref_cast::RefCast;
use ring::{
    aead::{self, BoundKey},
    hkdf,
};
use serde::Serialize;
use thiserror::Error;

use crate::rng::{Crng, RngExt};

const VERSION_LEN: usize = 1;
const KEY_ID_LEN: usize = 32;
const TAG_LEN: usize = 16;

/// The length of the final encrypted blob given an input plaintext length.
pub const fn encrypted_len(plaintext_len: usize) -> usize {
    VERSION_LEN + KEY_ID_LEN + plaintext_len + TAG_LEN
}

/// Derives unique single-use encrypt/decrypt keys for a long-term secret.
// We store the salted+extracted PRK directly to avoid recomputing it on
// every encrypt/decrypt call.
pub struct AesMasterKey(hkdf::Prk);

/// The value used to derive the single-use message key from the
/// [`AesMasterKey`] HKDF.
#[derive(RefCast, Serialize)]
#[repr(transparent)]
struct KeyId([u8; 32]);

/// Canonically serialized and passed to AES-256-GCM as the AAD. Binds the
/// protocol version, the key id, and any caller-supplied context segments.
#[derive(Serialize)]
struct Aad<'data, 'aad> {
    version: u8,
    key_id: &'data KeyId,
    aad: &'aad [&'aad [u8]],
}

struct EncryptKey(aead::SealingKey<ZeroNonce>);

struct DecryptKey(aead::OpeningKey<ZeroNonce>);

/// A single-use, all-zero nonce. Panics if reused for a second seal/open.
struct ZeroNonce(Option<aead::Nonce>);

#[derive(Clone, Debug, Error)]
#[error("decrypt error: ciphertext or metadata may be corrupted")]
pub struct DecryptError;

impl fmt::Debug for AesMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesMasterKey(..)")
    }
}

impl AesMasterKey {
    const HKDF_SALT: [u8; 32] = array::pad(*b"BROKER::AesMasterKey");

    pub fn new(secret: &[u8; 32]) -> Self {
        Self(hkdf::Salt::new(hkdf::HKDF_SHA256, &Self::HKDF_SALT).extract(secret))
    }

    fn derive_unbound_key(&self, key_id: &KeyId) -> aead::UnboundKey {
        aead::UnboundKey::from(
            self.0
                .expand(&[key_id.as_slice()], &aead::AES_256_GCM)
                .expect("HKDF expand with a fixed, valid output length never fails"),
        )
    }

    fn derive_encrypt_key(&self, key_id: &KeyId) -> EncryptKey {
        let key =
            aead::SealingKey::new(self.derive_unbound_key(key_id), ZeroNonce::new());
        EncryptKey(key)
    }

    fn derive_decrypt_key(&self, key_id: &KeyId) -> DecryptKey {
        let key =
            aead::OpeningKey::new(self.derive_unbound_key(key_id), ZeroNonce::new());
        DecryptKey(key)
    }

    pub fn encrypt<R: Crng>(
        &self,
        rng: &mut R,
        aad: &[&[u8]],
        plaintext: &[u8],
    ) -> Vec<u8> {
        let version = 0;
        let key_id = KeyId::from_rng(rng);

        let aad_bytes = Aad {
            version,
            key_id: &key_id,
            aad,
        }
        .serialize();

        let mut data = Vec::with_capacity(encrypted_len(plaintext.len()));
        data.push(version);
        data.extend_from_slice(key_id.as_slice());
        let plaintext_offset = data.len();
        data.extend_from_slice(plaintext);

        self.derive_encrypt_key(&key_id).encrypt_in_place(
            &aad_bytes,
            &mut data,
            plaintext_offset,
        );

        data
    }

    pub fn decrypt(
        &self,
        aad: &[&[u8]],
        mut data: Vec<u8>,
    ) -> Result<Vec<u8>, DecryptError> {
        const MIN_DATA_LEN: usize = encrypted_len(0);
        if data.len() < MIN_DATA_LEN {
            return Err(DecryptError);
        }

        let (version, key_id) = {
            let (version, rest) = data
                .split_first_chunk::<VERSION_LEN>()
                .expect("data.len() checked above");
            let (key_id, _) = rest
                .split_first_chunk::<KEY_ID_LEN>()
                .expect("data.len() checked above");
            (version[0], key_id)
        };

        if version != 0 {
            return Err(DecryptError);
        }
        let key_id = KeyId::from_ref(key_id);
        let decrypt_key = self.derive_decrypt_key(key_id);

        let aad_bytes = Aad {
            version,
            key_id,
            aad,
        }
        .serialize();

        let ciphertext_and_tag_offset = VERSION_LEN + KEY_ID_LEN;
        decrypt_key.decrypt_in_place(&aad_bytes, &mut data, ciphertext_and_tag_offset)?;

        Ok(data)
    }
}

impl EncryptKey {
    fn encrypt_in_place(
        mut self,
        aad: &[u8],
        data: &mut Vec<u8>,
        plaintext_offset: usize,
    ) {
        assert!(plaintext_offset <= data.len());
        let aad = aead::Aad::from(aad);
        let tag = self
            .0
            .seal_in_place_separate_tag(aad, &mut data[plaintext_offset..])
            .expect("cannot encrypt more than ~4 GiB at once");
        data.extend_from_slice(tag.as_ref());
    }
}

impl DecryptKey {
    fn decrypt_in_place(
        mut self,
        aad: &[u8],
        data: &mut Vec<u8>,
        ciphertext_and_tag_offset: usize,
    ) -> Result<(), DecryptError> {
        let aad = aead::Aad::from(aad);
        let plaintext_ref = self
            .0
            .open_within(aad, data, ciphertext_and_tag_offset..)
            .map_err(|_| DecryptError)?;
        let plaintext_len = plaintext_ref.len();
        data.truncate(plaintext_len);
        Ok(())
    }
}

impl KeyId {
    #[inline]
    fn from_ref(arr: &[u8; 32]) -> &Self {
        Self::ref_cast(arr)
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    fn from_rng<R: Crng>(rng: &mut R) -> Self {
        Self(rng.gen_bytes())
    }
}

impl Aad<'_, '_> {
    fn serialize(&self) -> Vec<u8> {
        let len = bcs::serialized_size(self)
            .expect("serializing the AAD should never fail");
        let mut out = Vec::with_capacity(len);
        bcs::serialize_into(&mut out, self)
            .expect("serializing the AAD should never fail");
        out
    }
}

impl ZeroNonce {
    fn new() -> Self {
        Self(Some(aead::Nonce::assume_unique_for_key([0u8; 12])))
    }
}

impl aead::NonceSequence for ZeroNonce {
    fn advance(&mut self) -> Result<aead::Nonce, ring::error::Unspecified> {
        Ok(self
            .0
            .take()
            .expect("encrypted/decrypted more than once with the same key"))
    }
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, collection::vec, prop_assert, prop_assert_eq, proptest};

    use super::*;
    use crate::rng::TestRng;

    fn test_key(seed: u64) -> AesMasterKey {
        let mut rng = TestRng::from_u64(seed);
        AesMasterKey::new(&rng.gen_bytes())
    }

    #[test]
    fn test_aad_compat() {
        let aad = Aad {
            version: 0,
            key_id: KeyId::from_ref(&[0x69; 32]),
            aad: &[],
        }
        .serialize();

        let expected_aad = crate::hex::decode(
            "00\
             6969696969696969696969696969696969696969696969696969696969696969\
             00",
        )
        .unwrap();

        assert_eq!(&aad, &expected_aad);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        proptest!(|(
            seed: u64,
            aad in vec(vec(any::<u8>(), 0..=16), 0..=4),
            plaintext in vec(any::<u8>(), 0..=256),
        )| {
            let mut rng = TestRng::from_u64(seed);
            let master_key = test_key(seed);

            let aad_ref = aad.iter().map(Vec::as_slice).collect::<Vec<_>>();

            let encrypted = master_key.encrypt(&mut rng, &aad_ref, &plaintext);
            let decrypted = master_key.decrypt(&aad_ref, encrypted.clone()).unwrap();
            prop_assert_eq!(&plaintext, &decrypted);

            let encrypted2 = master_key.encrypt(&mut rng, &aad_ref, &plaintext);
            prop_assert!(encrypted != encrypted2);
        });
    }

    #[test]
    fn test_decrypt_rejects_tampering() {
        let mut rng = TestRng::from_u64(7);
        let master_key = test_key(7);
        let mut encrypted = master_key.encrypt(&mut rng, &[b"ctx"], b"hello broker");
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(master_key.decrypt(&[b"ctx"], encrypted).is_err());
    }
}
