#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `credentials` persists per-account provider session tokens encrypted
//! with a machine-bound key (see the [`crypto`] crate), implementing
//! component C2 of the VaultSync specification.
//!
//! # Design
//!
//! The on-disk format is a single JSON object mapping account id to
//! `base64(IV ‖ ciphertext ‖ tag)`, at `<config_dir>/.sessions.enc`, with a
//! sibling `<config_dir>/.salt.bin` holding the 32-byte per-installation
//! salt [`crypto::machine_key`] is derived from. [`CredentialStore`] keeps
//! an in-memory mirror behind a [`std::sync::Mutex`] so reads never touch
//! disk, and every write goes through [`CredentialStore::persist`], which
//! writes to a sibling tempfile, `fsync`s it, then renames it over the
//! target — the on-disk file is never observed half-written.
//!
//! # Invariants
//!
//! - `store(id, token)` followed by `retrieve(id)` returns `token`.
//! - Concurrent `store` calls are serialized by the internal mutex.
//! - Removing an id that was never stored is a no-op, not an error.
//!
//! # Errors
//!
//! See [`CredentialError`], matching §7 of the specification: `NotFound`,
//! `IoFailed`, and `DecryptFailed` (wrapping [`crypto::CryptoError`]).

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crypto::KeyBytes;
use serde::{Deserialize, Serialize};

/// Errors produced by the credential store.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No session is stored for the requested account id.
    #[error("no stored session for account {0}")]
    NotFound(String),

    /// A filesystem operation failed.
    #[error("credential store I/O failure: {0}")]
    IoFailed(#[from] io::Error),

    /// The stored blob failed to decrypt.
    #[error("failed to decrypt stored session: {0}")]
    DecryptFailed(#[from] crypto::CryptoError),

    /// The on-disk JSON document was malformed.
    #[error("malformed credential store file: {0}")]
    MalformedStore(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(flatten)]
    entries: BTreeMap<String, String>,
}

/// Persists encrypted provider session tokens keyed by account id.
pub struct CredentialStore {
    sessions_path: PathBuf,
    salt_path: PathBuf,
    key: KeyBytes,
    entries: Mutex<BTreeMap<String, String>>,
}

impl CredentialStore {
    /// Opens (creating if absent) the credential store rooted at
    /// `config_dir`, deriving the machine key and generating
    /// `.salt.bin` on first use.
    pub fn open(config_dir: &Path) -> Result<Self, CredentialError> {
        fs::create_dir_all(config_dir)?;
        let sessions_path = config_dir.join(".sessions.enc");
        let salt_path = config_dir.join(".salt.bin");

        let salt = Self::load_or_create_salt(&salt_path)?;
        let key = crypto::machine_key(&salt)
            .map_err(CredentialError::DecryptFailed)?;

        let entries = if sessions_path.exists() {
            let raw = fs::read_to_string(&sessions_path)?;
            let parsed: StoreFile = serde_json::from_str(&raw)?;
            parsed.entries
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            sessions_path,
            salt_path,
            key,
            entries: Mutex::new(entries),
        })
    }

    fn load_or_create_salt(salt_path: &Path) -> Result<[u8; crypto::KEY_SIZE], CredentialError> {
        if salt_path.exists() {
            let raw = fs::read(salt_path)?;
            let mut salt = [0u8; crypto::KEY_SIZE];
            if raw.len() == crypto::KEY_SIZE {
                salt.copy_from_slice(&raw);
                return Ok(salt);
            }
            tracing::warn!("salt file has unexpected length, regenerating");
        }
        let salt = crypto::generate_salt();
        write_atomic(salt_path, &salt)?;
        Ok(salt)
    }

    /// Encrypts `session_token` and stores it under `account_id`,
    /// replacing any existing entry, then persists the store.
    pub fn store(&self, account_id: &str, session_token: &str) -> Result<(), CredentialError> {
        let blob = crypto::encrypt(session_token.as_bytes(), &self.key)?;
        {
            let mut entries = self.entries.lock().expect("credential mutex poisoned");
            entries.insert(account_id.to_string(), blob);
        }
        self.persist()?;
        tracing::debug!(account_id, "stored encrypted session");
        Ok(())
    }

    /// Retrieves and decrypts the session token for `account_id`.
    pub fn retrieve(&self, account_id: &str) -> Result<String, CredentialError> {
        let blob = {
            let entries = self.entries.lock().expect("credential mutex poisoned");
            entries
                .get(account_id)
                .cloned()
                .ok_or_else(|| CredentialError::NotFound(account_id.to_string()))?
        };
        let plaintext = crypto::decrypt(&blob, &self.key)?;
        String::from_utf8(plaintext).map_err(|e| {
            CredentialError::DecryptFailed(crypto::CryptoError::CipherInitFailed(e.to_string()))
        })
    }

    /// Removes the stored session for `account_id`. A no-op if none
    /// exists.
    pub fn remove(&self, account_id: &str) -> Result<(), CredentialError> {
        let removed = {
            let mut entries = self.entries.lock().expect("credential mutex poisoned");
            entries.remove(account_id).is_some()
        };
        if removed {
            self.persist()?;
        }
        Ok(())
    }

    /// Lists every account id with a stored session.
    pub fn list_ids(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("credential mutex poisoned");
        entries.keys().cloned().collect()
    }

    /// Removes every stored session.
    pub fn clear(&self) -> Result<(), CredentialError> {
        {
            let mut entries = self.entries.lock().expect("credential mutex poisoned");
            entries.clear();
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), CredentialError> {
        let entries = self.entries.lock().expect("credential mutex poisoned");
        let file = StoreFile {
            entries: entries.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.sessions_path, &json)?;
        Ok(())
    }

    /// Path to the encrypted sessions file, for diagnostics.
    #[must_use]
    pub fn sessions_path(&self) -> &Path {
        &self.sessions_path
    }

    /// Path to the per-installation salt file, for diagnostics.
    #[must_use]
    pub fn salt_path(&self) -> &Path {
        &self.salt_path
    }
}

/// Writes `contents` to `path` via a sibling tempfile, `fsync`, then
/// rename, so readers never observe a half-written file.
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    io::Write::write_all(&mut tmp, contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_retrieve_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).unwrap();
        store.store("acc-00000001", "session-token-abc").unwrap();
        assert_eq!(store.retrieve("acc-00000001").unwrap(), "session-token-abc");
    }

    #[test]
    fn retrieve_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).unwrap();
        let err = store.retrieve("acc-ghost").unwrap_err();
        assert!(matches!(err, CredentialError::NotFound(_)));
    }

    #[test]
    fn remove_missing_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).unwrap();
        store.remove("never-existed").unwrap();
    }

    #[test]
    fn reopening_reloads_persisted_sessions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CredentialStore::open(dir.path()).unwrap();
            store.store("acc-1", "tok-1").unwrap();
        }
        let reopened = CredentialStore::open(dir.path()).unwrap();
        assert_eq!(reopened.retrieve("acc-1").unwrap(), "tok-1");
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).unwrap();
        store.store("acc-1", "tok-1").unwrap();
        store.store("acc-2", "tok-2").unwrap();
        store.clear().unwrap();
        assert!(store.list_ids().is_empty());
    }

    #[test]
    fn tampered_blob_fails_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).unwrap();
        store.store("acc-1", "tok-1").unwrap();

        let raw = fs::read_to_string(store.sessions_path()).unwrap();
        let mut parsed: StoreFile = serde_json::from_str(&raw).unwrap();
        let blob = parsed.entries.get_mut("acc-1").unwrap();
        blob.replace_range(0..1, if blob.starts_with('A') { "B" } else { "A" });
        fs::write(store.sessions_path(), serde_json::to_vec_pretty(&parsed).unwrap()).unwrap();

        let reopened = CredentialStore::open(dir.path()).unwrap();
        let err = reopened.retrieve("acc-1").unwrap_err();
        assert!(matches!(err, CredentialError::DecryptFailed(_)));
    }
}
