//! The session-token codec (C3): `base64url(header) "." base64url(ciphertext)`
//! binding a session id to an encrypted copy of its password.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use broker_crypto::{
    kms::{BrokerKey, Kms},
    ExposeSecret,
};

use crate::error::BrokerError;
use crate::session::Session;

const TOKEN_SEPARATOR: char = '.';

/// The (untrusted) header embedded in a session token. Integrity comes only
/// from the ciphertext half; the header is used strictly as a lookup key,
/// never trusted on its own (see `DESIGN.md`).
#[derive(Serialize, Deserialize)]
struct Header<'a> {
    session_id: &'a str,
}

/// Build a session token: encrypt the session's password under the
/// delegation-secret key, then join the base64url header and ciphertext
/// with a `.`.
pub fn encode(kms: &dyn Kms, session: &Session) -> String {
    let header = Header {
        session_id: &session.id,
    };
    let header_json =
        serde_json::to_vec(&header).expect("session id is always valid utf8 json");
    let ciphertext = kms.encrypt(
        BrokerKey::DelegationSecret,
        session.password.expose_secret().as_bytes(),
    );

    format!(
        "{}{TOKEN_SEPARATOR}{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(ciphertext),
    )
}

/// Split a token into its session id and the encrypted password, without
/// checking the password. Any malformed structure fails with
/// `Unauthenticated`, matching §4.3.
pub fn decode(token: &str) -> Result<(String, Vec<u8>), BrokerError> {
    let invalid = || BrokerError::unauthenticated("Invalid session token");

    let mut parts = token.splitn(2, TOKEN_SEPARATOR);
    let header_b64 = parts.next().ok_or_else(invalid)?;
    let ciphertext_b64 = parts.next().ok_or_else(invalid)?;
    if parts.next().is_some() {
        return Err(invalid());
    }

    let header_json = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| invalid())?;
    let header: Header = serde_json::from_slice(&header_json).map_err(|_| invalid())?;
    let ciphertext = URL_SAFE_NO_PAD
        .decode(ciphertext_b64)
        .map_err(|_| invalid())?;

    Ok((header.session_id.to_owned(), ciphertext))
}

/// Decrypt `ciphertext` under the delegation-secret key and compare against
/// `session.password`. `session.password` is a secret; we compare in
/// constant time.
pub fn verify(kms: &dyn Kms, session: &Session, ciphertext: Vec<u8>) -> bool {
    let decrypted = match kms.decrypt(BrokerKey::DelegationSecret, ciphertext) {
        Ok(plaintext) => plaintext,
        Err(_) => return false,
    };
    let expected = session.password.expose_secret().as_bytes();
    decrypted.len() == expected.len() && decrypted.as_slice().ct_eq(expected).into()
}

#[cfg(test)]
mod test {
    use broker_crypto::{kms::DevKms, rng::TestRng, Secret};
    use proptest::prelude::*;

    use super::*;
    use crate::session::SessionLifetime;

    fn test_kms() -> DevKms {
        DevKms::new(&[1u8; 32], &[2u8; 32], &[3u8; 32])
    }

    fn lifetime() -> SessionLifetime {
        SessionLifetime {
            renew_period_ms: 24 * 3_600 * 1_000,
            maximum_lifetime_ms: 7 * 24 * 3_600 * 1_000,
        }
    }

    #[test]
    fn token_roundtrip() {
        let kms = test_kms();
        let mut rng = TestRng::from_u64(9);
        let session = Session::new(
            &mut rng,
            "alice@EXAMPLE.COM".to_owned(),
            "yarn@FOO.BAR".to_owned(),
            "gs://example".to_owned(),
            "scope".to_owned(),
            lifetime(),
        );

        let token = encode(&kms, &session);
        let (session_id, ciphertext) = decode(&token).unwrap();
        assert_eq!(session_id, session.id);
        assert!(verify(&kms, &session, ciphertext));
    }

    #[test]
    fn rejects_malformed_token() {
        for token in ["foobar", &URL_SAFE_NO_PAD.encode(b"foobar")] {
            assert!(decode(token).is_err());
        }
    }

    #[test]
    fn rejects_wrong_password() {
        let kms = test_kms();
        let mut rng = TestRng::from_u64(10);
        let mut session = Session::new(
            &mut rng,
            "alice@EXAMPLE.COM".to_owned(),
            "yarn@FOO.BAR".to_owned(),
            "gs://example".to_owned(),
            "scope".to_owned(),
            lifetime(),
        );
        let token = encode(&kms, &session);
        let (_, ciphertext) = decode(&token).unwrap();

        session.password = Secret::new("a-different-password".to_owned());
        assert!(!verify(&kms, &session, ciphertext));
    }

    proptest! {
        #[test]
        fn roundtrips_for_arbitrary_session_fields(
            seed in any::<u64>(),
            owner in "[a-zA-Z0-9@.]{1,32}",
            renewer in "[a-zA-Z0-9@.]{1,32}",
            target in "[a-zA-Z0-9:/._-]{0,32}",
            scope in "[a-zA-Z0-9:/._,-]{0,64}",
        ) {
            let kms = test_kms();
            let mut rng = TestRng::from_u64(seed);
            let session = Session::new(&mut rng, owner, renewer, target, scope, lifetime());

            let token = encode(&kms, &session);
            let (session_id, ciphertext) = decode(&token).unwrap();
            prop_assert_eq!(&session_id, &session.id);
            prop_assert!(verify(&kms, &session, ciphertext));
        }

        #[test]
        fn rejects_any_ciphertext_under_the_wrong_key(
            seed in any::<u64>(),
            other_delegation_seed in any::<[u8; 32]>(),
        ) {
            let kms = test_kms();
            let other_kms = DevKms::new(&[1u8; 32], &[2u8; 32], &other_delegation_seed);
            let mut rng = TestRng::from_u64(seed);
            let session = Session::new(
                &mut rng,
                "alice@EXAMPLE.COM".to_owned(),
                "yarn@FOO.BAR".to_owned(),
                "gs://example".to_owned(),
                "scope".to_owned(),
                lifetime(),
            );

            let token = encode(&other_kms, &session);
            let (_, ciphertext) = decode(&token).unwrap();
            if other_delegation_seed != [3u8; 32] {
                prop_assert!(!verify(&kms, &session, ciphertext));
            }
        }
    }
}
