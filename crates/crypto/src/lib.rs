#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `crypto` implements the authenticated-encryption and key-derivation
//! primitives the rest of the VaultSync workspace builds on: encrypting a
//! provider session token before it touches disk (`credentials`), deriving a
//! key from a user password, and deriving a key bound to the current
//! machine so an exfiltrated credential file is useless elsewhere.
//!
//! # Design
//!
//! [`encrypt`]/[`decrypt`] use ChaCha20-Poly1305, an AEAD cipher whose
//! 256-bit key, 96-bit nonce, and 128-bit tag line up exactly with
//! [`KEY_SIZE`], [`IV_SIZE`], and [`TAG_SIZE`]. [`derive_key`] runs
//! PBKDF2-HMAC-SHA-256. [`machine_key`] folds together stable
//! machine identifiers with a per-installation salt through a single
//! HMAC-SHA-256 pass, trading PBKDF2's brute-force cost (irrelevant here,
//! since the "password" is never typed by anyone) for fast, deterministic
//! startup.
//!
//! # Invariants
//!
//! - `decrypt(encrypt(p, k), k) == p` for any plaintext `p` and key `k`.
//! - Flipping any bit of an `encrypt` output causes `decrypt` to fail with
//!   [`CryptoError::AuthenticationFailed`], never to succeed with altered
//!   plaintext.
//! - [`machine_key`] is reproducible across runs given the same machine and
//!   salt, and differs across machines with overwhelming probability.
//!
//! # Errors
//!
//! [`CryptoError`] distinguishes cipher-library/CSPRNG failure from
//! authentication failure from malformed input, matching §7 of the VaultSync
//! specification.

use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

/// Size, in bytes, of every derived or provided symmetric key.
pub const KEY_SIZE: usize = 32;
/// Size, in bytes, of the random nonce prepended to every ciphertext blob.
pub const IV_SIZE: usize = 12;
/// Size, in bytes, of the Poly1305 authentication tag appended to every blob.
pub const TAG_SIZE: usize = 16;

/// PBKDF2 iteration count used by [`derive_key`].
///
/// Fixed rather than configurable: a fixed count keeps every installation's
/// key-derivation cost identical and auditable, balancing startup latency
/// against brute-force resistance.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// A 256-bit symmetric key.
pub type KeyBytes = [u8; KEY_SIZE];

/// Errors produced by the crypto primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The ciphertext's authentication tag did not verify; the blob was
    /// tampered with, corrupted, or encrypted under a different key.
    #[error("authentication failed: ciphertext was tampered with or key is wrong")]
    AuthenticationFailed,

    /// The blob was shorter than `IV_SIZE + TAG_SIZE`, or was not valid
    /// base64.
    #[error("malformed ciphertext blob")]
    MalformedInput,

    /// The CSPRNG or the underlying cipher implementation failed to
    /// initialize.
    #[error("cipher initialization failed: {0}")]
    CipherInitFailed(String),

    /// The current machine's stable identifiers could not be read.
    #[error("failed to read machine identity: {0}")]
    MachineIdentityUnavailable(String),
}

/// Encrypts `plaintext` under `key`, returning `base64(IV ‖ ciphertext ‖ tag)`.
///
/// A fresh 96-bit nonce is drawn from the OS CSPRNG for every call; reusing
/// a nonce under the same key is the one thing that breaks ChaCha20-Poly1305,
/// so this function never accepts a caller-supplied nonce.
pub fn encrypt(plaintext: &[u8], key: &KeyBytes) -> Result<String, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::CipherInitFailed(e.to_string()))?;

    let mut blob = Vec::with_capacity(IV_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);

    Ok(base64::engine::general_purpose::STANDARD.encode(blob))
}

/// Decrypts a `base64(IV ‖ ciphertext ‖ tag)` blob produced by [`encrypt`].
pub fn decrypt(blob: &str, key: &KeyBytes) -> Result<Vec<u8>, CryptoError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|_| CryptoError::MalformedInput)?;

    if raw.len() < IV_SIZE + TAG_SIZE {
        return Err(CryptoError::MalformedInput);
    }

    let (nonce_bytes, ciphertext) = raw.split_at(IV_SIZE);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Derives a 256-bit key from `password` and `salt` using PBKDF2-HMAC-SHA-256.
pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> KeyBytes {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, iterations, &mut key)
        .expect("HMAC-SHA-256 output length is always valid for a 32-byte key");
    key
}

/// Generates a fresh per-installation salt for [`machine_key`].
///
/// Called once, the first time the credential store runs on a machine; the
/// result is persisted to `.salt.bin` and reused on every subsequent run.
pub fn generate_salt() -> [u8; KEY_SIZE] {
    let mut salt = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derives a key bound to the current machine.
///
/// Folds together the machine's UUID (or closest platform equivalent),
/// hostname, kernel type, and OS type with `install_salt` through a single
/// HMAC-SHA-256 pass. The result is stable across runs on the same machine
/// and, because `install_salt` never leaves the machine, infeasible to
/// reproduce elsewhere even by an attacker who knows the hostname.
pub fn machine_key(install_salt: &[u8; KEY_SIZE]) -> Result<KeyBytes, CryptoError> {
    let identity = machine_identity_string()?;

    let mut mac = Hmac::<Sha256>::new_from_slice(install_salt)
        .map_err(|e| CryptoError::CipherInitFailed(e.to_string()))?;
    mac.update(identity.as_bytes());
    let tag = mac.finalize().into_bytes();

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&tag);

    let mut identity = identity;
    identity.zeroize();

    Ok(key)
}

fn machine_identity_string() -> Result<String, CryptoError> {
    let machine_id = machine_uid::get()
        .map_err(|e| CryptoError::MachineIdentityUnavailable(e.to_string()))?;
    let hostname = sysinfo::System::host_name().unwrap_or_default();
    let kernel = sysinfo::System::kernel_version().unwrap_or_default();
    let os = sysinfo::System::long_os_version().unwrap_or_default();

    Ok(format!("{machine_id}\0{hostname}\0{kernel}\0{os}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [7u8; KEY_SIZE];
        let blob = encrypt(b"hunter2-session-token", &key).unwrap();
        let plain = decrypt(&blob, &key).unwrap();
        assert_eq!(plain, b"hunter2-session-token");
    }

    #[test]
    fn tamper_detection() {
        let key = [1u8; KEY_SIZE];
        let blob = encrypt(b"sensitive", &key).unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&blob)
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = base64::engine::general_purpose::STANDARD.encode(raw);

        let err = decrypt(&tampered, &key).unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed));
    }

    #[test]
    fn malformed_blob_is_rejected() {
        let key = [0u8; KEY_SIZE];
        let short = base64::engine::general_purpose::STANDARD.encode(b"too short");
        let err = decrypt(&short, &key).unwrap_err();
        assert!(matches!(err, CryptoError::MalformedInput));
    }

    #[test]
    fn malformed_base64_is_rejected() {
        let key = [0u8; KEY_SIZE];
        let err = decrypt("not valid base64 !!!", &key).unwrap_err();
        assert!(matches!(err, CryptoError::MalformedInput));
    }

    #[test]
    fn derive_key_is_deterministic() {
        let salt = b"fixed-salt-for-test-purposes-32";
        let a = derive_key("correct horse battery staple", salt, 1_000);
        let b = derive_key("correct horse battery staple", salt, 1_000);
        assert_eq!(a, b);
    }

    #[test]
    fn derive_key_differs_by_password() {
        let salt = b"fixed-salt-for-test-purposes-32";
        let a = derive_key("password-one", salt, 1_000);
        let b = derive_key("password-two", salt, 1_000);
        assert_ne!(a, b);
    }

    #[test]
    fn machine_key_is_reproducible() {
        let salt = generate_salt();
        let a = machine_key(&salt).unwrap();
        let b = machine_key(&salt).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn machine_key_differs_by_salt() {
        let a = machine_key(&generate_salt()).unwrap();
        let b = machine_key(&generate_salt()).unwrap();
        assert_ne!(a, b);
    }
}
