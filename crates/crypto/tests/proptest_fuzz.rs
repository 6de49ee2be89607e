//! Property-based fuzz tests for the authenticated-encryption primitives.
//!
//! These exercise the invariants documented on [`crypto::encrypt`]/
//! [`crypto::decrypt`]: round-tripping any plaintext under any key, and
//! rejecting any single-bit tamper of the ciphertext with
//! `AuthenticationFailed` rather than silently returning altered plaintext.

use crypto::{decrypt, encrypt, CryptoError, KeyBytes, KEY_SIZE};
use proptest::prelude::*;

fn arbitrary_key() -> impl Strategy<Value = KeyBytes> {
    proptest::collection::vec(any::<u8>(), KEY_SIZE).prop_map(|bytes| {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        key
    })
}

fn arbitrary_plaintext() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..512)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Any plaintext, under any key, must decrypt back to itself.
    #[test]
    fn round_trips_under_arbitrary_key(plaintext in arbitrary_plaintext(), key in arbitrary_key()) {
        let blob = encrypt(&plaintext, &key).unwrap();
        let decrypted = decrypt(&blob, &key).unwrap();
        prop_assert_eq!(decrypted, plaintext);
    }

    /// Decrypting under the wrong key must never succeed, and must never
    /// return altered plaintext instead of an error.
    #[test]
    fn wrong_key_never_decrypts(plaintext in arbitrary_plaintext(), key in arbitrary_key(), other_key in arbitrary_key()) {
        prop_assume!(key != other_key);
        let blob = encrypt(&plaintext, &key).unwrap();
        let result = decrypt(&blob, &other_key);
        prop_assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    /// Flipping any single bit of a ciphertext blob must be caught by the
    /// authentication tag, never silently accepted.
    #[test]
    fn single_bit_tamper_is_detected(
        plaintext in arbitrary_plaintext(),
        key in arbitrary_key(),
        flip_byte in any::<usize>(),
        flip_bit in 0u8..8,
    ) {
        let blob = encrypt(&plaintext, &key).unwrap();
        let mut raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &blob).unwrap();
        let index = flip_byte % raw.len();
        raw[index] ^= 1 << flip_bit;
        let tampered = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, raw);

        let result = decrypt(&tampered, &key);
        prop_assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }
}
