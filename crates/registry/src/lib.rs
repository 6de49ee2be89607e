#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `registry` implements component C7 of the VaultSync specification: the
//! public entry point of the whole system. It owns the account and group
//! maps, dispatches logins to the [`sessions`] pool, persists itself to
//! `accounts.json`, and republishes [`xfer::XferEvent::SyncStatusChanged`]
//! as its own `sync_status_changed` event so collaborators never need to
//! subscribe to the transfer engine directly.
//!
//! # Design
//!
//! Mirrors `credentials::CredentialStore`'s file-backed shape: an
//! in-memory mirror behind a mutex, persisted atomically to a sibling
//! tempfile-then-rename. The specification asks for account/group
//! mutation to happen "only on the main thread," a GUI-event-loop
//! constraint that has no analogue in a CLI process; here the same
//! safety property — no two mutations interleave — is provided by the
//! registry's internal mutex instead, so every public method is callable
//! from any task.
//!
//! A single well-known default group (id [`DEFAULT_GROUP_ID`]) is created
//! on first run and can never be removed.
//!
//! # Invariants
//!
//! - `accounts.json` always round-trips through [`Registry::open`] and
//!   every subsequent mutating call, which persists before returning.
//! - [`DEFAULT_GROUP_ID`] always exists in the group map.
//! - Removing a non-default group reparents its accounts to the default
//!   group unless the caller passes an explicit replacement.
//!
//! # Errors
//!
//! See [`RegistryError`], covering account/group lookups plus the
//! propagated [`credentials::CredentialError`] and [`sessions::SessionError`].

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use credentials::CredentialStore;
use logging::Verbosity;
use sdk::ProviderClient;
use serde::{Deserialize, Serialize};
use sessions::{ClientFactory, SessionPool};
use tokio::sync::{broadcast, Mutex};

/// Well-known id of the default group, present for the lifetime of every registry.
pub const DEFAULT_GROUP_ID: &str = "grp-00000000";

/// Errors produced by the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No account exists with the given id.
    #[error("no account with id {0}")]
    AccountNotFound(String),

    /// No group exists with the given id.
    #[error("no group with id {0}")]
    GroupNotFound(String),

    /// The default group cannot be removed.
    #[error("the default group cannot be removed")]
    CannotRemoveDefaultGroup,

    /// An account with this email is already registered.
    #[error("account with email {0} already exists")]
    DuplicateEmail(String),

    /// The credential store rejected an operation.
    #[error(transparent)]
    Credential(#[from] credentials::CredentialError),

    /// The session pool rejected a login.
    #[error(transparent)]
    Session(#[from] sessions::SessionError),

    /// A filesystem operation on `accounts.json` failed.
    #[error("registry I/O failure: {0}")]
    IoFailed(#[from] io::Error),

    /// The on-disk `accounts.json` document was malformed.
    #[error("malformed registry file: {0}")]
    MalformedStore(#[from] serde_json::Error),
}

/// A user identity on the cloud provider, uniquely identified by a
/// process-local `"acc-XXXXXXXX"` string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Opaque stable id, `"acc-XXXXXXXX"`.
    pub id: String,
    /// Login email; non-empty.
    pub email: String,
    /// User-facing display name, defaults to `email` if unset.
    pub display_name: String,
    /// The group this account belongs to; always a valid group id.
    pub group_id: String,
    /// Ordered set of free-form tag strings.
    pub labels: Vec<String>,
    /// Optional UI accent color, e.g. `"#3478f6"`.
    pub color: Option<String>,
    /// Free-form user notes.
    pub notes: String,
    /// Whether this is the account selected on a fresh process start.
    pub is_default: bool,
    /// Last known storage usage in bytes.
    pub storage_used: u64,
    /// Last known storage quota in bytes.
    pub storage_total: u64,
    /// Unix timestamp (seconds) of the last successful login.
    pub last_login: Option<i64>,
    /// Unix timestamp (seconds) of the last completed sync/transfer.
    pub last_sync: Option<i64>,
}

/// A named collection of accounts, orderable and collapsible in the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Opaque stable id, `"grp-XXXXXXXX"`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional UI accent color.
    pub color: Option<String>,
    /// Position among sibling groups; lower sorts first.
    pub sort_order: i64,
    /// Whether the group is collapsed in the sidebar.
    pub collapsed: bool,
}

/// Registry-wide settings persisted alongside accounts and groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSettings {
    /// Forwarded to [`sessions::SessionPool::with_limits`] at startup.
    pub max_cached_sessions: usize,
    /// Seconds between background storage-quota refreshes.
    pub session_refresh_interval: u64,
    /// Whether to attempt silent session restore for every account on startup.
    pub auto_restore_session: bool,
    /// Whether the account switcher shows live storage usage.
    pub show_storage_in_switcher: bool,
    /// Whether `add_account` persists the session token to the credential
    /// store at all. When `false` the session is usable for the lifetime
    /// of the process but is gone on restart.
    pub remember_login: bool,
    /// Verbosity installed via `logging::install` at startup.
    pub verbosity: Verbosity,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            max_cached_sessions: sessions::DEFAULT_MAX_CACHED_SESSIONS,
            session_refresh_interval: 300,
            auto_restore_session: true,
            show_storage_in_switcher: true,
            remember_login: true,
            verbosity: Verbosity::default(),
        }
    }
}

/// Events emitted by the registry, per §6 of the specification.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A new account finished logging in and was registered.
    AccountAdded(Account),
    /// `add_account` failed before a record could be created.
    AccountAddFailed {
        /// The email that failed to log in.
        email: String,
        /// A human-readable cause.
        error: String,
    },
    /// An account was removed.
    AccountRemoved(String),
    /// An account's fields were updated.
    AccountUpdated(Account),
    /// The active account changed.
    AccountSwitched(String),
    /// Incremental login progress for the UI's progress indicator.
    LoginProgress {
        /// The email logging in.
        email: String,
        /// Completion percent, `0..=100`.
        percent: u8,
        /// Short human-readable status.
        status: String,
    },
    /// The stored session rejected itself; the user must log in again.
    LoginRequired(String),
    /// An account's session became ready.
    SessionReady(String),
    /// An account's session failed.
    SessionError {
        /// Affected account id.
        id: String,
        /// Cause.
        error: String,
    },
    /// A previously ready session expired.
    SessionExpired(String),
    /// Storage usage/quota changed.
    StorageInfoUpdated(String),
    /// An account's syncing badge changed, republished from the transfer engine.
    SyncStatusChanged {
        /// Affected account id.
        id: String,
        /// Whether it is now syncing.
        syncing: bool,
    },
}

/// Generates a fresh account id, `"acc-"` followed by 8 lowercase hex digits.
#[must_use]
pub fn new_account_id() -> String {
    format!("acc-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Generates a fresh group id, `"grp-"` followed by 8 lowercase hex digits.
#[must_use]
pub fn new_group_id() -> String {
    format!("grp-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    active_account_id: Option<String>,
    accounts: Vec<Account>,
    groups: Vec<Group>,
    settings: AccountSettings,
}

struct State {
    active_account_id: Option<String>,
    accounts: BTreeMap<String, Account>,
    groups: BTreeMap<String, Group>,
    settings: AccountSettings,
}

/// Source of truth for accounts, groups, the active account, and settings.
pub struct Registry {
    path: PathBuf,
    state: Mutex<State>,
    credentials: Arc<CredentialStore>,
    sessions: Arc<SessionPool>,
    client_factory: Arc<dyn ClientFactory>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    /// Opens (creating if absent) the registry rooted at `config_dir`,
    /// using `credentials` for session persistence, `sessions` for
    /// bring-up, and `client_factory` to create fresh unauthenticated
    /// clients for password logins.
    pub fn open(
        config_dir: &Path,
        credentials: Arc<CredentialStore>,
        sessions: Arc<SessionPool>,
        client_factory: Arc<dyn ClientFactory>,
    ) -> Result<Arc<Self>, RegistryError> {
        fs::create_dir_all(config_dir)?;
        let path = config_dir.join("accounts.json");

        let mut file = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str::<StoreFile>(&raw)?
        } else {
            StoreFile::default()
        };

        if !file.groups.iter().any(|g| g.id == DEFAULT_GROUP_ID) {
            file.groups.push(Group {
                id: DEFAULT_GROUP_ID.to_string(),
                name: "All Accounts".to_string(),
                color: None,
                sort_order: 0,
                collapsed: false,
            });
        }

        let accounts = file
            .accounts
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        let groups = file.groups.into_iter().map(|g| (g.id.clone(), g)).collect();

        let settings = file.settings;
        let to_persist = StoreFile {
            active_account_id: file.active_account_id.clone(),
            accounts: accounts.values().cloned().collect::<Vec<Account>>(),
            groups: groups.values().cloned().collect::<Vec<Group>>(),
            settings: settings.clone(),
        };
        write_atomic(&path, &serde_json::to_vec_pretty(&to_persist)?)?;

        let (events, _rx) = broadcast::channel(256);
        let registry = Arc::new(Self {
            path,
            state: Mutex::new(State {
                active_account_id: file.active_account_id,
                accounts,
                groups,
                settings,
            }),
            credentials,
            sessions,
            client_factory,
            events,
        });
        Ok(registry)
    }

    /// Resolves the config directory per the specification: the platform
    /// config directory joined with `vaultsync`, unless a `portable.marker`
    /// file sits next to the running executable, in which case that
    /// executable's own directory is used instead.
    pub fn config_dir() -> io::Result<PathBuf> {
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                if dir.join("portable.marker").exists() {
                    return Ok(dir.to_path_buf());
                }
            }
        }
        dirs::config_dir()
            .map(|d| d.join("vaultsync"))
            .ok_or_else(|| io::Error::other("no platform config directory available"))
    }

    /// Subscribes to registry events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    /// Logs in with `email`/`password`, stores the resulting session
    /// (unless `remember_login` is `false`), registers the account, and
    /// emits `account_added` or `account_add_failed`.
    pub async fn add_account(
        self: &Arc<Self>,
        email: &str,
        password: &str,
    ) -> Result<Account, RegistryError> {
        {
            let state = self.state.lock().await;
            if state.accounts.values().any(|a| a.email == email) {
                let err = RegistryError::DuplicateEmail(email.to_string());
                self.emit(RegistryEvent::AccountAddFailed {
                    email: email.to_string(),
                    error: err.to_string(),
                });
                return Err(err);
            }
        }

        self.emit(RegistryEvent::LoginProgress {
            email: email.to_string(),
            percent: 0,
            status: "logging in".to_string(),
        });

        let id = new_account_id();
        let client = self.client_factory.create_client(&id);
        let login = client.login(email, password).await;
        let token = match login {
            Ok(token) => token,
            Err(e) => {
                let msg = e.message.clone();
                tracing::warn!(email, error = %msg, "login failed");
                self.emit(RegistryEvent::AccountAddFailed {
                    email: email.to_string(),
                    error: msg.clone(),
                });
                return Err(RegistryError::Session(sessions::SessionError::ProviderError(e)));
            }
        };

        self.emit(RegistryEvent::LoginProgress {
            email: email.to_string(),
            percent: 50,
            status: "fetching account".to_string(),
        });

        if let Err(e) = client.fetch_nodes().await {
            self.emit(RegistryEvent::AccountAddFailed {
                email: email.to_string(),
                error: e.message.clone(),
            });
            return Err(RegistryError::Session(sessions::SessionError::FetchNodesFailed(e)));
        }

        let remember = { self.state.lock().await.settings.remember_login };
        if remember {
            self.credentials.store(&id, &token.0)?;
        }

        self.sessions.seed_ready(&id, client.clone()).await?;

        let account = self
            .add_account_with_session(email, &id, remember)
            .await?;

        tracing::info!(account_id = %id, email, "account added");
        self.emit(RegistryEvent::SessionReady(id.clone()));
        Ok(account)
    }

    /// Registers an account that already has a live or credential-store
    /// session, skipping the password-login round trip. `remember` mirrors
    /// whether a credential was actually persisted for `id`.
    pub async fn add_account_with_session(
        self: &Arc<Self>,
        email: &str,
        id: &str,
        remember: bool,
    ) -> Result<Account, RegistryError> {
        let is_default = {
            let state = self.state.lock().await;
            state.accounts.is_empty()
        };

        let account = Account {
            id: id.to_string(),
            email: email.to_string(),
            display_name: email.to_string(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            labels: Vec::new(),
            color: None,
            notes: String::new(),
            is_default,
            storage_used: 0,
            storage_total: 0,
            last_login: Some(now_secs()),
            last_sync: None,
        };

        {
            let mut state = self.state.lock().await;
            state.accounts.insert(account.id.clone(), account.clone());
            if is_default || state.active_account_id.is_none() {
                state.active_account_id = Some(account.id.clone());
            }
        }
        let _ = remember;
        self.persist().await?;
        self.emit(RegistryEvent::AccountAdded(account.clone()));
        Ok(account)
    }

    /// Removes `id`, optionally deleting its stored credential, and
    /// reparents nothing (the account simply disappears from every group).
    pub async fn remove_account(
        self: &Arc<Self>,
        id: &str,
        delete_session: bool,
    ) -> Result<(), RegistryError> {
        {
            let mut state = self.state.lock().await;
            if state.accounts.remove(id).is_none() {
                return Err(RegistryError::AccountNotFound(id.to_string()));
            }
            if state.active_account_id.as_deref() == Some(id) {
                state.active_account_id = state.accounts.keys().next().cloned();
            }
        }
        if delete_session {
            self.credentials.remove(id)?;
        }
        self.sessions.invalidate(id).await;
        self.persist().await?;
        tracing::info!(account_id = id, delete_session, "account removed");
        self.emit(RegistryEvent::AccountRemoved(id.to_string()));
        Ok(())
    }

    /// Applies `mutate` to the stored account and persists the result.
    pub async fn update_account(
        self: &Arc<Self>,
        id: &str,
        mutate: impl FnOnce(&mut Account),
    ) -> Result<Account, RegistryError> {
        let updated = {
            let mut state = self.state.lock().await;
            let account = state
                .accounts
                .get_mut(id)
                .ok_or_else(|| RegistryError::AccountNotFound(id.to_string()))?;
            mutate(account);
            account.clone()
        };
        self.persist().await?;
        self.emit(RegistryEvent::AccountUpdated(updated.clone()));
        Ok(updated)
    }

    /// Makes `id` the active account.
    pub async fn switch_to(self: &Arc<Self>, id: &str) -> Result<(), RegistryError> {
        {
            let mut state = self.state.lock().await;
            if !state.accounts.contains_key(id) {
                return Err(RegistryError::AccountNotFound(id.to_string()));
            }
            state.active_account_id = Some(id.to_string());
        }
        self.persist().await?;
        self.emit(RegistryEvent::AccountSwitched(id.to_string()));
        Ok(())
    }

    /// Returns every registered account.
    pub async fn all_accounts(&self) -> Vec<Account> {
        self.state.lock().await.accounts.values().cloned().collect()
    }

    /// Returns every group, in no particular order (callers sort by
    /// `sort_order` for display).
    pub async fn all_groups(&self) -> Vec<Group> {
        self.state.lock().await.groups.values().cloned().collect()
    }

    /// Returns every account belonging to `group_id`.
    pub async fn accounts_in_group(&self, group_id: &str) -> Vec<Account> {
        self.state
            .lock()
            .await
            .accounts
            .values()
            .filter(|a| a.group_id == group_id)
            .cloned()
            .collect()
    }

    /// Case-insensitive substring search over email, display name,
    /// labels, and notes.
    pub async fn search(&self, query: &str) -> Vec<Account> {
        let needle = query.to_lowercase();
        self.state
            .lock()
            .await
            .accounts
            .values()
            .filter(|a| {
                a.email.to_lowercase().contains(&needle)
                    || a.display_name.to_lowercase().contains(&needle)
                    || a.notes.to_lowercase().contains(&needle)
                    || a.labels.iter().any(|l| l.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect()
    }

    /// Exact, case-insensitive match against an account's label set;
    /// distinct from [`Registry::search`]'s substring matching.
    pub async fn find_by_label(&self, label: &str) -> Vec<Account> {
        let needle = label.to_lowercase();
        self.state
            .lock()
            .await
            .accounts
            .values()
            .filter(|a| a.labels.iter().any(|l| l.to_lowercase() == needle))
            .cloned()
            .collect()
    }

    /// Calls through the session pool to the SDK's account-details
    /// primitive and updates `storage_used`/`storage_total`, emitting
    /// `storage_info_updated`.
    pub async fn refresh_storage(self: &Arc<Self>, id: &str) -> Result<Account, RegistryError> {
        let client = self.sessions.ensure_session(id).await?;
        let details = client
            .account_details()
            .await
            .map_err(sessions::SessionError::from)?;
        self.update_account(id, |a| {
            a.storage_used = details.storage_used;
            a.storage_total = details.storage_total;
        })
        .await
        .map(|account| {
            self.emit(RegistryEvent::StorageInfoUpdated(id.to_string()));
            account
        })
    }

    /// Creates a new group.
    pub async fn add_group(self: &Arc<Self>, name: &str) -> Result<Group, RegistryError> {
        let group = {
            let mut state = self.state.lock().await;
            let sort_order = state.groups.len() as i64;
            let group = Group {
                id: new_group_id(),
                name: name.to_string(),
                color: None,
                sort_order,
                collapsed: false,
            };
            state.groups.insert(group.id.clone(), group.clone());
            group
        };
        self.persist().await?;
        Ok(group)
    }

    /// Removes `id`, reparenting its accounts to `reassign_to` (or the
    /// default group if `None`). The default group itself cannot be removed.
    pub async fn remove_group(
        self: &Arc<Self>,
        id: &str,
        reassign_to: Option<&str>,
    ) -> Result<(), RegistryError> {
        if id == DEFAULT_GROUP_ID {
            return Err(RegistryError::CannotRemoveDefaultGroup);
        }
        let target = reassign_to.unwrap_or(DEFAULT_GROUP_ID).to_string();
        {
            let mut state = self.state.lock().await;
            if !state.groups.contains_key(&target) {
                return Err(RegistryError::GroupNotFound(target));
            }
            if state.groups.remove(id).is_none() {
                return Err(RegistryError::GroupNotFound(id.to_string()));
            }
            for account in state.accounts.values_mut() {
                if account.group_id == id {
                    account.group_id = target.clone();
                }
            }
        }
        self.persist().await?;
        tracing::debug!(group_id = id, reparented_to = %target, "group removed");
        Ok(())
    }

    /// Assigns `sort_order` to every group in `ids` by its position in
    /// the slice; groups not named in `ids` keep their relative order,
    /// appended after.
    pub async fn reorder_groups(self: &Arc<Self>, ids: &[String]) -> Result<(), RegistryError> {
        {
            let mut state = self.state.lock().await;
            for (position, id) in ids.iter().enumerate() {
                if let Some(group) = state.groups.get_mut(id) {
                    group.sort_order = position as i64;
                }
            }
            let mut next = ids.len() as i64;
            let mut remaining: Vec<String> = state
                .groups
                .keys()
                .filter(|id| !ids.contains(id))
                .cloned()
                .collect();
            remaining.sort_by_key(|id| state.groups[id].sort_order);
            for id in remaining {
                if let Some(group) = state.groups.get_mut(&id) {
                    group.sort_order = next;
                    next += 1;
                }
            }
        }
        self.persist().await
    }

    /// Returns a copy of the current settings.
    pub async fn settings(&self) -> AccountSettings {
        self.state.lock().await.settings.clone()
    }

    /// Replaces the settings wholesale and persists.
    pub async fn update_settings(
        self: &Arc<Self>,
        settings: AccountSettings,
    ) -> Result<(), RegistryError> {
        {
            let mut state = self.state.lock().await;
            state.settings = settings;
        }
        self.persist().await
    }

    /// Forwards the engine's `SyncStatusChanged` event as the registry's
    /// own event, so collaborators only need one subscription.
    pub fn relay_sync_status(self: &Arc<Self>, mut rx: broadcast::Receiver<xfer::XferEvent>) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(xfer::XferEvent::SyncStatusChanged { account_id, syncing }) => {
                        registry.emit(RegistryEvent::SyncStatusChanged {
                            id: account_id,
                            syncing,
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("sync status relay stopped: transfer engine channel closed");
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "sync status relay fell behind the transfer engine");
                        continue;
                    }
                }
            }
        });
    }

    async fn persist(&self) -> Result<(), RegistryError> {
        let state = self.state.lock().await;
        let file = StoreFile {
            active_account_id: state.active_account_id.clone(),
            accounts: state.accounts.values().cloned().collect(),
            groups: state.groups.values().cloned().collect(),
            settings: state.settings.clone(),
        };
        drop(state);
        let json = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &json)?;
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    io::Write::write_all(&mut tmp, contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn now_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::{MockProviderClient, PublicLinkRegistry};

    struct Factory {
        links: PublicLinkRegistry,
    }

    impl ClientFactory for Factory {
        fn create_client(&self, account_id: &str) -> Arc<dyn ProviderClient> {
            Arc::new(MockProviderClient::new(account_id, self.links.clone()))
        }
    }

    async fn fixture() -> (Arc<Registry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let credentials = Arc::new(CredentialStore::open(dir.path()).unwrap());
        let links = PublicLinkRegistry::new();
        let factory: Arc<dyn ClientFactory> = Arc::new(Factory { links: links.clone() });
        let pool = Arc::new(SessionPool::new(factory.clone(), credentials.clone()));
        let registry = Registry::open(dir.path(), credentials, pool, factory).unwrap();
        (registry, dir)
    }

    #[tokio::test]
    async fn add_account_registers_and_marks_default() {
        let (registry, _dir) = fixture().await;
        let account = registry.add_account("alice@example.com", "pw").await.unwrap();
        assert!(account.is_default);
        assert_eq!(account.group_id, DEFAULT_GROUP_ID);
        assert_eq!(registry.all_accounts().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let (registry, _dir) = fixture().await;
        registry.add_account("alice@example.com", "pw").await.unwrap();
        let err = registry.add_account("alice@example.com", "pw2").await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateEmail(_)));
    }

    #[tokio::test]
    async fn remove_account_deletes_credential_when_requested() {
        let (registry, _dir) = fixture().await;
        let account = registry.add_account("alice@example.com", "pw").await.unwrap();
        registry.remove_account(&account.id, true).await.unwrap();
        assert!(registry.all_accounts().await.is_empty());
    }

    #[tokio::test]
    async fn search_matches_email_and_labels_case_insensitively() {
        let (registry, _dir) = fixture().await;
        let account = registry.add_account("alice@example.com", "pw").await.unwrap();
        registry
            .update_account(&account.id, |a| a.labels.push("Work".to_string()))
            .await
            .unwrap();
        assert_eq!(registry.search("ALICE").await.len(), 1);
        assert_eq!(registry.find_by_label("work").await.len(), 1);
        assert_eq!(registry.find_by_label("wor").await.len(), 0);
    }

    #[tokio::test]
    async fn reopening_reloads_persisted_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let links = PublicLinkRegistry::new();
        {
            let credentials = Arc::new(CredentialStore::open(dir.path()).unwrap());
            let factory: Arc<dyn ClientFactory> = Arc::new(Factory { links: links.clone() });
            let pool = Arc::new(SessionPool::new(factory.clone(), credentials.clone()));
            let registry = Registry::open(dir.path(), credentials, pool, factory).unwrap();
            registry.add_account("alice@example.com", "pw").await.unwrap();
        }
        let credentials = Arc::new(CredentialStore::open(dir.path()).unwrap());
        let factory: Arc<dyn ClientFactory> = Arc::new(Factory { links });
        let pool = Arc::new(SessionPool::new(factory.clone(), credentials.clone()));
        let reopened = Registry::open(dir.path(), credentials, pool, factory).unwrap();
        assert_eq!(reopened.all_accounts().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_group_reparents_accounts_to_default() {
        let (registry, _dir) = fixture().await;
        let account = registry.add_account("alice@example.com", "pw").await.unwrap();
        let group = registry.add_group("Work").await.unwrap();
        registry
            .update_account(&account.id, |a| a.group_id = group.id.clone())
            .await
            .unwrap();
        registry.remove_group(&group.id, None).await.unwrap();
        let accounts = registry.all_accounts().await;
        assert_eq!(accounts[0].group_id, DEFAULT_GROUP_ID);
    }

    #[tokio::test]
    async fn default_group_cannot_be_removed() {
        let (registry, _dir) = fixture().await;
        let err = registry.remove_group(DEFAULT_GROUP_ID, None).await.unwrap_err();
        assert!(matches!(err, RegistryError::CannotRemoveDefaultGroup));
    }

    #[tokio::test]
    async fn reorder_groups_assigns_sort_order_by_position() {
        let (registry, _dir) = fixture().await;
        let a = registry.add_group("A").await.unwrap();
        let b = registry.add_group("B").await.unwrap();
        registry
            .reorder_groups(&[b.id.clone(), a.id.clone()])
            .await
            .unwrap();
        let groups: BTreeMap<String, Group> = registry
            .all_groups()
            .await
            .into_iter()
            .map(|g| (g.id.clone(), g))
            .collect();
        assert_eq!(groups[&b.id].sort_order, 0);
        assert_eq!(groups[&a.id].sort_order, 1);
        assert_eq!(groups[DEFAULT_GROUP_ID].sort_order, 2);
    }

    #[tokio::test]
    async fn relay_sync_status_republishes_engine_events() {
        let (registry, _dir) = fixture().await;
        let (tx, rx) = tokio::sync::broadcast::channel(8);
        registry.relay_sync_status(rx);
        let mut registry_rx = registry.subscribe();

        tx.send(xfer::XferEvent::SyncStatusChanged {
            account_id: "acc-1".to_string(),
            syncing: true,
        })
        .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), registry_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            RegistryEvent::SyncStatusChanged { id, syncing } => {
                assert_eq!(id, "acc-1");
                assert!(syncing);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
