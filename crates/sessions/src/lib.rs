#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `sessions` implements component C4 of the VaultSync specification: a
//! bounded pool that multiplexes authenticated provider client handles
//! across many accounts, bringing each one up through a linear state
//! machine and evicting the least-recently-used idle session under
//! pressure.
//!
//! # Design
//!
//! One [`SessionEntry`] exists per account id, guarded by its own
//! `tokio::sync::Mutex` so unrelated accounts never block each other.
//! Admission (capacity check + LRU eviction) is a short critical section
//! taken under a single pool-wide lock *before* any SDK call, so no lock
//! is ever held across a suspension point — mirroring the workspace-wide
//! rule the teacher enforces with `clippy::await_holding_lock`. A second
//! `ensure_session` call for an account already bringing itself up blocks
//! on that account's own entry lock and observes the finished state
//! instead of starting a second login.
//!
//! # Invariants
//!
//! - At most `max_cached_sessions` entries are in state [`SessionState::Ready`]
//!   at any time.
//! - Two concurrent [`SessionPool::ensure_session`] calls for the same
//!   account cause exactly one provider login.
//! - A session pinned by an in-progress cross-account transfer
//!   ([`SessionPool::mark_in_use`]) is never chosen for eviction.
//!
//! # Errors
//!
//! See [`SessionError`], matching §7: `NotLoggedIn`, `FetchNodesFailed`,
//! `PoolExhausted`, `Timeout`, `ProviderError`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sdk::{ProviderClient, ProviderError, ProviderErrorKind};
use tokio::sync::Mutex;

/// Default cap on concurrently live (`Ready`) sessions.
pub const DEFAULT_MAX_CACHED_SESSIONS: usize = 5;
/// Default deadline for [`SessionPool::ensure_session`] to wait for an
/// evictable slot before failing with [`SessionError::PoolExhausted`].
pub const DEFAULT_POOL_EXHAUSTED_DEADLINE: Duration = Duration::from_secs(60);
/// How long bring-up polls for the root node's child population to
/// become observable after `fetch_nodes` itself does not confirm success.
pub const NODE_FETCH_POLL_DEADLINE: Duration = Duration::from_secs(12);

/// Lifecycle state of a per-account session, per §3 of the specification.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// No live handle; nothing in flight.
    Empty,
    /// A `fast_login` request is outstanding.
    LoggingIn,
    /// Login succeeded; waiting for the node tree to become usable.
    FetchingNodes,
    /// Authenticated and usable.
    Ready,
    /// Bring-up failed terminally; see the carried error.
    Failed(SessionError),
    /// Being evicted; transitions to `Empty` once the handle is dropped.
    Evicting,
}

/// Errors produced by the session pool.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// No stored credential (or stored credential rejected) for this
    /// account.
    #[error("account is not logged in")]
    NotLoggedIn,

    /// `fetch_nodes` failed, or the root's children never became
    /// observable within the poll deadline.
    #[error("failed to fetch node tree: {0}")]
    FetchNodesFailed(ProviderError),

    /// No evictable slot became available before the deadline.
    #[error("session pool exhausted: no evictable session within deadline")]
    PoolExhausted,

    /// A wait (bring-up, `wait_for_session`) exceeded its deadline.
    #[error("timed out waiting for session")]
    Timeout,

    /// The provider SDK returned an error outside the above categories.
    #[error(transparent)]
    ProviderError(#[from] ProviderError),
}

/// Builds a [`ProviderClient`] for a given account id.
///
/// The production implementation wraps the bundled cloud SDK's client
/// constructor; tests use a factory that hands out
/// [`sdk::MockProviderClient`] instances.
pub trait ClientFactory: Send + Sync {
    /// Creates a fresh, not-yet-authenticated client handle for
    /// `account_id`.
    fn create_client(&self, account_id: &str) -> Arc<dyn ProviderClient>;
}

struct SessionEntry {
    state: SessionState,
    client: Option<Arc<dyn ProviderClient>>,
    last_used: Instant,
    in_use: u32,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            state: SessionState::Empty,
            client: None,
            last_used: Instant::now(),
            in_use: 0,
        }
    }
}

/// Source of session tokens for bring-up; implemented by
/// `credentials::CredentialStore` in production.
pub trait TokenSource: Send + Sync {
    /// Returns the stored session token for `account_id`, if any.
    fn session_token(&self, account_id: &str) -> Option<String>;
}

impl TokenSource for credentials::CredentialStore {
    fn session_token(&self, account_id: &str) -> Option<String> {
        self.retrieve(account_id).ok()
    }
}

/// A bounded pool of live, authenticated provider sessions.
pub struct SessionPool {
    factory: Arc<dyn ClientFactory>,
    tokens: Arc<dyn TokenSource>,
    entries: DashMap<String, Arc<Mutex<SessionEntry>>>,
    max_cached: usize,
    pool_exhausted_deadline: Duration,
    admission_lock: Mutex<()>,
    evictions: AtomicU32,
}

impl SessionPool {
    /// Creates a pool with [`DEFAULT_MAX_CACHED_SESSIONS`] and
    /// [`DEFAULT_POOL_EXHAUSTED_DEADLINE`].
    #[must_use]
    pub fn new(factory: Arc<dyn ClientFactory>, tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_limits(
            factory,
            tokens,
            DEFAULT_MAX_CACHED_SESSIONS,
            DEFAULT_POOL_EXHAUSTED_DEADLINE,
        )
    }

    /// Creates a pool with explicit capacity and exhaustion deadline.
    #[must_use]
    pub fn with_limits(
        factory: Arc<dyn ClientFactory>,
        tokens: Arc<dyn TokenSource>,
        max_cached: usize,
        pool_exhausted_deadline: Duration,
    ) -> Self {
        Self {
            factory,
            tokens,
            entries: DashMap::new(),
            max_cached,
            pool_exhausted_deadline,
            admission_lock: Mutex::new(()),
            evictions: AtomicU32::new(0),
        }
    }

    fn entry_for(&self, account_id: &str) -> Arc<Mutex<SessionEntry>> {
        self.entries
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionEntry::new())))
            .clone()
    }

    /// Brings `account_id` up to `Ready` if it is not already, returning
    /// the live client handle.
    pub async fn ensure_session(
        &self,
        account_id: &str,
    ) -> Result<Arc<dyn ProviderClient>, SessionError> {
        let entry = self.entry_for(account_id);
        let mut guard = entry.lock().await;

        if let SessionState::Ready = guard.state {
            if let Some(client) = &guard.client {
                guard.last_used = Instant::now();
                return Ok(client.clone());
            }
        }

        self.admit(account_id).await?;

        guard.state = SessionState::LoggingIn;
        let token = match self.tokens.session_token(account_id) {
            Some(t) => t,
            None => {
                guard.state = SessionState::Failed(SessionError::NotLoggedIn);
                return Err(SessionError::NotLoggedIn);
            }
        };

        let client = self.factory.create_client(account_id);
        if let Err(e) = client.fast_login(&token).await {
            let err = SessionError::ProviderError(e);
            guard.state = SessionState::Failed(err.clone());
            return Err(err);
        }

        guard.state = SessionState::FetchingNodes;
        if let Err(e) = bring_up_nodes(client.as_ref()).await {
            guard.state = SessionState::Failed(e.clone());
            return Err(e);
        }

        guard.state = SessionState::Ready;
        guard.client = Some(client.clone());
        guard.last_used = Instant::now();
        tracing::info!(account_id, "session ready");
        Ok(client)
    }

    /// Admits `account_id` (evicting if necessary) and installs `client`
    /// directly as its `Ready` handle, skipping `fast_login`/`fetch_nodes`.
    ///
    /// Used by the registry's `add_account` flow, which already holds a
    /// freshly authenticated client from a password `login` call and has
    /// no separate stored token to hand to the normal bring-up path.
    pub async fn seed_ready(
        &self,
        account_id: &str,
        client: Arc<dyn ProviderClient>,
    ) -> Result<(), SessionError> {
        let entry = self.entry_for(account_id);
        let mut guard = entry.lock().await;
        self.admit(account_id).await?;
        guard.state = SessionState::Ready;
        guard.client = Some(client);
        guard.last_used = Instant::now();
        Ok(())
    }

    /// Non-blocking lookup; returns a handle only if the account is
    /// currently `Ready`.
    pub fn get_session(&self, account_id: &str) -> Option<Arc<dyn ProviderClient>> {
        let entry = self.entries.get(account_id)?.clone();
        let guard = entry.try_lock().ok()?;
        match (&guard.state, &guard.client) {
            (SessionState::Ready, Some(client)) => Some(client.clone()),
            _ => None,
        }
    }

    /// Blocks up to `timeout_ms` for `account_id` to reach `Ready`.
    pub async fn wait_for_session(&self, account_id: &str, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.get_session(account_id).is_some() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Transitions `account_id` to `Empty`, discarding any live handle.
    pub async fn invalidate(&self, account_id: &str) {
        if let Some(entry) = self.entries.get(account_id) {
            let entry = entry.clone();
            let mut guard = entry.lock().await;
            if let Some(client) = guard.client.take() {
                let _ = client.logout().await;
            }
            guard.state = SessionState::Empty;
        }
    }

    /// Returns `true` if `account_id` currently has a `Ready` handle.
    pub fn is_active(&self, account_id: &str) -> bool {
        self.get_session(account_id).is_some()
    }

    /// Pins a `Ready` session so it is never chosen for eviction, e.g.
    /// while a cross-account transfer holds it.
    pub async fn mark_in_use(&self, account_id: &str) {
        if let Some(entry) = self.entries.get(account_id) {
            let entry = entry.clone();
            let mut guard = entry.lock().await;
            guard.in_use += 1;
        }
    }

    /// Releases a pin taken by [`SessionPool::mark_in_use`].
    pub async fn mark_idle(&self, account_id: &str) {
        if let Some(entry) = self.entries.get(account_id) {
            let entry = entry.clone();
            let mut guard = entry.lock().await;
            guard.in_use = guard.in_use.saturating_sub(1);
        }
    }

    /// Number of evictions performed over the pool's lifetime, exposed
    /// for tests and diagnostics.
    #[must_use]
    pub fn eviction_count(&self) -> u32 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Ensures there is room for one more `Ready` session, evicting the
    /// least-recently-used idle one if at capacity, or waiting up to the
    /// pool's exhaustion deadline.
    async fn admit(&self, requesting_account: &str) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.pool_exhausted_deadline;
        loop {
            {
                let _guard = self.admission_lock.lock().await;
                let ready: Vec<(String, Instant, u32)> = self
                    .entries
                    .iter()
                    .filter_map(|kv| {
                        let id = kv.key().clone();
                        if id == requesting_account {
                            return None;
                        }
                        let guard = kv.value().try_lock().ok()?;
                        match guard.state {
                            SessionState::Ready => {
                                Some((id, guard.last_used, guard.in_use))
                            }
                            _ => None,
                        }
                    })
                    .collect();

                if ready.len() < self.max_cached {
                    return Ok(());
                }

                let victim = ready
                    .into_iter()
                    .filter(|(_, _, in_use)| *in_use == 0)
                    .min_by_key(|(_, last_used, _)| *last_used)
                    .map(|(id, _, _)| id);

                if let Some(victim_id) = victim {
                    drop(_guard);
                    self.evict(&victim_id).await;
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(SessionError::PoolExhausted);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn evict(&self, account_id: &str) {
        if let Some(entry) = self.entries.get(account_id) {
            let entry = entry.clone();
            let mut guard = entry.lock().await;
            guard.state = SessionState::Evicting;
            if let Some(client) = guard.client.take() {
                let _ = client.logout().await;
            }
            guard.state = SessionState::Empty;
        }
        self.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(account_id, "evicted least-recently-used session");
    }
}

async fn bring_up_nodes(client: &dyn ProviderClient) -> Result<(), SessionError> {
    match client.fetch_nodes().await {
        Ok(()) => return Ok(()),
        Err(e) if matches!(e.kind, ProviderErrorKind::Authentication) => {
            return Err(SessionError::FetchNodesFailed(e));
        }
        Err(_) => {}
    }

    let deadline = Instant::now() + NODE_FETCH_POLL_DEADLINE;
    loop {
        if let Ok(root) = client.root().await {
            if client.children(&root).await.is_ok() {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(SessionError::FetchNodesFailed(ProviderError {
                code: 0,
                message: "node tree never became observable".to_string(),
                kind: ProviderErrorKind::Other,
            }));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::{MockProviderClient, PublicLinkRegistry};
    use std::sync::atomic::AtomicUsize;

    struct MockFactory {
        links: PublicLinkRegistry,
        logins: Arc<AtomicUsize>,
    }

    impl ClientFactory for MockFactory {
        fn create_client(&self, account_id: &str) -> Arc<dyn ProviderClient> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Arc::new(MockProviderClient::new(account_id, self.links.clone()))
        }
    }

    struct StaticTokens;
    impl TokenSource for StaticTokens {
        fn session_token(&self, account_id: &str) -> Option<String> {
            Some(format!("token-for-{account_id}"))
        }
    }

    struct MissingTokens;
    impl TokenSource for MissingTokens {
        fn session_token(&self, _account_id: &str) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn ensure_session_reaches_ready() {
        let logins = Arc::new(AtomicUsize::new(0));
        let pool = SessionPool::new(
            Arc::new(MockFactory {
                links: PublicLinkRegistry::new(),
                logins: logins.clone(),
            }),
            Arc::new(StaticTokens),
        );
        let client = pool.ensure_session("acc-1").await.unwrap();
        assert!(pool.is_active("acc-1"));
        assert_eq!(client.account_details().await.unwrap().storage_used, 0);
    }

    #[tokio::test]
    async fn missing_credential_fails_not_logged_in() {
        let pool = SessionPool::new(
            Arc::new(MockFactory {
                links: PublicLinkRegistry::new(),
                logins: Arc::new(AtomicUsize::new(0)),
            }),
            Arc::new(MissingTokens),
        );
        let err = pool.ensure_session("acc-ghost").await.unwrap_err();
        assert!(matches!(err, SessionError::NotLoggedIn));
    }

    #[tokio::test]
    async fn concurrent_ensure_session_single_flights_login() {
        let logins = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(SessionPool::new(
            Arc::new(MockFactory {
                links: PublicLinkRegistry::new(),
                logins: logins.clone(),
            }),
            Arc::new(StaticTokens),
        ));

        let p1 = pool.clone();
        let p2 = pool.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { p1.ensure_session("acc-1").await }),
            tokio::spawn(async move { p2.ensure_session("acc-1").await }),
        );
        r1.unwrap().unwrap();
        r2.unwrap().unwrap();
        assert_eq!(logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pool_evicts_lru_when_at_capacity() {
        let pool = SessionPool::with_limits(
            Arc::new(MockFactory {
                links: PublicLinkRegistry::new(),
                logins: Arc::new(AtomicUsize::new(0)),
            }),
            Arc::new(StaticTokens),
            2,
            Duration::from_secs(5),
        );

        pool.ensure_session("acc-1").await.unwrap();
        pool.ensure_session("acc-2").await.unwrap();
        pool.ensure_session("acc-3").await.unwrap();

        assert!(!pool.is_active("acc-1"));
        assert!(pool.is_active("acc-2"));
        assert!(pool.is_active("acc-3"));
        assert_eq!(pool.eviction_count(), 1);
    }

    #[tokio::test]
    async fn pinned_session_is_never_evicted() {
        let pool = SessionPool::with_limits(
            Arc::new(MockFactory {
                links: PublicLinkRegistry::new(),
                logins: Arc::new(AtomicUsize::new(0)),
            }),
            Arc::new(StaticTokens),
            1,
            Duration::from_millis(300),
        );

        pool.ensure_session("acc-1").await.unwrap();
        pool.mark_in_use("acc-1").await;

        let err = pool.ensure_session("acc-2").await.unwrap_err();
        assert!(matches!(err, SessionError::PoolExhausted));
    }
}
