#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `sdk` models the bundled cloud-provider SDK that `spec.md` §1 treats as
//! an external collaborator: "a client handle with `login`, `fast_login`,
//! `fetch_nodes`, ..., each returning a success/failure with a provider
//! error code. All SDK calls are modeled as asynchronous requests that
//! complete via a per-request callback."
//!
//! # Design
//!
//! The source leans on listener objects registered per request; in Rust
//! that collapses to [`ProviderClient`], an async trait whose methods
//! return a future resolving to `Result<T, ProviderError>` directly — no
//! listener boilerplate. [`MockProviderClient`] is an in-memory
//! implementation backing every other crate's test suite, playing the
//! role the teacher workspace's `test-support` crate plays for the rsync
//! engine.
//!
//! Every [`Node`] obtained from a [`ProviderClient`] call is a plain,
//! `Clone`-able value type, not a handle requiring release: unlike the
//! original C++ SDK (which hands back owning pointers some call sites
//! leak and others double-free), this trait never returns a resource the
//! caller must remember to close.
//!
//! # Errors
//!
//! [`ProviderError`] carries the provider's numeric error code alongside a
//! human-readable message and a coarse [`ProviderErrorKind`] the session
//! pool and transfer engine switch on (authentication-class errors trigger
//! `login_required`, for instance).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

/// Opaque identifier for a node (file or folder) on the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// A provider node: a file or folder, addressed by absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Opaque provider-side identifier.
    pub id: NodeId,
    /// Absolute path within the account's tree.
    pub path: String,
    /// `true` for folders, `false` for files.
    pub is_folder: bool,
    /// File size in bytes; `0` for folders.
    pub size: u64,
    /// Whether this node currently has an active public export link.
    pub is_exported: bool,
}

/// An exported public link, opaque to callers beyond round-tripping it
/// through [`ProviderClient::public_node_for_link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicLink(pub String);

/// Handle to an in-flight upload or download, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(pub u64);

/// An opaque, persistable session token returned by [`ProviderClient::login`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken(pub String);

/// Account-level storage quota information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountDetails {
    /// Bytes currently used.
    pub storage_used: u64,
    /// Total bytes available under the account's plan.
    pub storage_total: u64,
}

/// Coarse classification of [`ProviderError`], used to decide retryability
/// and whether to surface `login_required`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The session is expired or the credentials were rejected.
    Authentication,
    /// The requested node does not exist.
    NotFound,
    /// The provider is rate-limiting this client.
    RateLimited,
    /// Network-level failure reaching the provider.
    Network,
    /// Any other provider-side failure.
    Other,
}

/// An error returned by the provider SDK.
#[derive(Debug, Clone, thiserror::Error)]
#[error("provider error {code}: {message}")]
pub struct ProviderError {
    /// Provider-defined numeric error code.
    pub code: i32,
    /// Human-readable error message from the provider.
    pub message: String,
    /// Coarse classification used for retry/auth decisions.
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    /// Builds an authentication-class error (expired session or bad
    /// credentials).
    #[must_use]
    pub fn authentication(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            kind: ProviderErrorKind::Authentication,
        }
    }

    /// Builds a not-found error for a missing node.
    #[must_use]
    pub fn not_found(path: impl Into<String>) -> Self {
        Self {
            code: 404,
            message: format!("node not found: {}", path.into()),
            kind: ProviderErrorKind::NotFound,
        }
    }
}

/// Async interface to the bundled cloud-provider SDK.
///
/// Every method models one asynchronous SDK request; the future resolves
/// when the provider's completion callback would have fired.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Authenticates with email and password, returning a fresh session
    /// token the caller is responsible for persisting.
    async fn login(&self, email: &str, password: &str) -> Result<SessionToken, ProviderError>;

    /// Restores a session from a previously stored token without
    /// prompting for credentials.
    async fn fast_login(&self, session_token: &str) -> Result<(), ProviderError>;

    /// Populates the in-memory node tree after a successful login.
    async fn fetch_nodes(&self) -> Result<(), ProviderError>;

    /// Invalidates the current session on the provider side.
    async fn logout(&self) -> Result<(), ProviderError>;

    /// Returns the root node of the account's tree.
    async fn root(&self) -> Result<Node, ProviderError>;

    /// Resolves an absolute path to a node.
    async fn node_by_path(&self, path: &str) -> Result<Node, ProviderError>;

    /// Lists the direct children of a folder node.
    async fn children(&self, node: &Node) -> Result<Vec<Node>, ProviderError>;

    /// Creates a folder named `name` under `parent`.
    async fn create_folder(&self, name: &str, parent: &Node) -> Result<Node, ProviderError>;

    /// Renames `node` in place.
    async fn rename(&self, node: &Node, new_name: &str) -> Result<(), ProviderError>;

    /// Moves `node` under `new_parent`.
    async fn move_node(&self, node: &Node, new_parent: &Node) -> Result<(), ProviderError>;

    /// Permanently removes `node`.
    async fn remove(&self, node: &Node) -> Result<(), ProviderError>;

    /// Copies `node` into `new_parent`, returning the new node.
    async fn copy_node(&self, node: &Node, new_parent: &Node) -> Result<Node, ProviderError>;

    /// Creates a non-expiring, non-writable, non-provider-hosted public
    /// link for `node`. Reuses the existing link if one is already active.
    async fn export_node(&self, node: &Node) -> Result<PublicLink, ProviderError>;

    /// Disables a previously created public link for `node`.
    async fn disable_export(&self, node: &Node) -> Result<(), ProviderError>;

    /// Resolves a public link into an importable node handle, as seen by
    /// whichever account calls this (possibly a different account than
    /// the one that exported it).
    async fn public_node_for_link(&self, link: &PublicLink) -> Result<Node, ProviderError>;

    /// Begins an upload of a local file into `parent`.
    async fn start_upload(
        &self,
        local_path: &str,
        parent: &Node,
    ) -> Result<TransferHandle, ProviderError>;

    /// Begins a download of `node` to a local path.
    async fn start_download(
        &self,
        node: &Node,
        local_path: &str,
    ) -> Result<TransferHandle, ProviderError>;

    /// Cancels an in-flight upload or download.
    async fn cancel_transfer(&self, handle: &TransferHandle) -> Result<(), ProviderError>;

    /// Returns current storage quota usage for the account.
    async fn account_details(&self) -> Result<AccountDetails, ProviderError>;
}

struct MockTree {
    nodes: HashMap<NodeId, Node>,
    by_path: HashMap<String, NodeId>,
    exports: HashMap<NodeId, PublicLink>,
    next_id: u64,
}

impl MockTree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        let mut by_path = HashMap::new();
        let root = Node {
            id: NodeId(0),
            path: "/".to_string(),
            is_folder: true,
            size: 0,
            is_exported: false,
        };
        by_path.insert(root.path.clone(), root.id);
        nodes.insert(root.id, root);
        Self {
            nodes,
            by_path,
            exports: HashMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// In-memory [`ProviderClient`] implementation used by every crate's test
/// suite in place of the real provider SDK.
///
/// Accounts are looked up by a shared [`PublicLinkRegistry`] so a link
/// exported from one mock client can be imported by another, modeling
/// cross-account transfer without a real provider.
pub struct MockProviderClient {
    account_email: String,
    logged_in: Mutex<bool>,
    nodes_fetched: Mutex<bool>,
    tree: Mutex<MockTree>,
    links: PublicLinkRegistry,
    next_transfer: AtomicU64,
    /// When set, every `*_fail_after` counter reaching zero fails the next
    /// call of that kind — used by tests to simulate provider errors.
    pub fail_next_export: Arc<std::sync::atomic::AtomicBool>,
    pub fail_next_import: Arc<std::sync::atomic::AtomicBool>,
}

/// A process-wide registry mapping exported links to their source node,
/// shared across every [`MockProviderClient`] instance in a test so that
/// cross-account import resolves correctly.
#[derive(Clone, Default)]
pub struct PublicLinkRegistry {
    inner: Arc<DashMap<String, Node>>,
    counter: Arc<AtomicU64>,
}

impl PublicLinkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, node: Node) -> PublicLink {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let link = format!("vault://link/{id}");
        self.inner.insert(link.clone(), node);
        PublicLink(link)
    }

    fn resolve(&self, link: &PublicLink) -> Option<Node> {
        self.inner.get(&link.0).map(|r| r.clone())
    }

    fn revoke_for_path(&self, path: &str) {
        self.inner.retain(|_, node| node.path != path);
    }
}

impl MockProviderClient {
    /// Creates a new mock client for `account_email`, sharing `links` with
    /// any other mock clients that should be able to import each other's
    /// exports.
    #[must_use]
    pub fn new(account_email: impl Into<String>, links: PublicLinkRegistry) -> Self {
        Self {
            account_email: account_email.into(),
            logged_in: Mutex::new(false),
            nodes_fetched: Mutex::new(false),
            tree: Mutex::new(MockTree::new()),
            links,
            next_transfer: AtomicU64::new(1),
            fail_next_export: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            fail_next_import: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Seeds a file at `path` with `size` bytes, creating any missing
    /// parent folders. Test-only convenience; the real SDK has no
    /// equivalent because files arrive via upload.
    pub async fn seed_file(&self, path: &str, size: u64) {
        let mut tree = self.tree.lock().await;
        Self::ensure_parents(&mut tree, path);
        let id = tree.allocate_id();
        let node = Node {
            id,
            path: path.to_string(),
            is_folder: false,
            size,
            is_exported: false,
        };
        tree.by_path.insert(path.to_string(), id);
        tree.nodes.insert(id, node);
    }

    fn ensure_parents(tree: &mut MockTree, path: &str) {
        let mut acc = String::new();
        for segment in path.trim_start_matches('/').split('/').rev().skip(1).rev() {
            if segment.is_empty() {
                continue;
            }
            acc.push('/');
            acc.push_str(segment);
            if !tree.by_path.contains_key(&acc) {
                let id = tree.allocate_id();
                let node = Node {
                    id,
                    path: acc.clone(),
                    is_folder: true,
                    size: 0,
                    is_exported: false,
                };
                tree.by_path.insert(acc.clone(), id);
                tree.nodes.insert(id, node);
            }
        }
    }

    /// The account email this mock client is authenticated as.
    #[must_use]
    pub fn account_email(&self) -> &str {
        &self.account_email
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn login(&self, email: &str, _password: &str) -> Result<SessionToken, ProviderError> {
        *self.logged_in.lock().await = true;
        Ok(SessionToken(format!("mock-session-{email}")))
    }

    async fn fast_login(&self, _session_token: &str) -> Result<(), ProviderError> {
        *self.logged_in.lock().await = true;
        Ok(())
    }

    async fn fetch_nodes(&self) -> Result<(), ProviderError> {
        if !*self.logged_in.lock().await {
            return Err(ProviderError::authentication(401, "not logged in"));
        }
        *self.nodes_fetched.lock().await = true;
        Ok(())
    }

    async fn logout(&self) -> Result<(), ProviderError> {
        *self.logged_in.lock().await = false;
        Ok(())
    }

    async fn root(&self) -> Result<Node, ProviderError> {
        let tree = self.tree.lock().await;
        Ok(tree.nodes[&NodeId(0)].clone())
    }

    async fn node_by_path(&self, path: &str) -> Result<Node, ProviderError> {
        let tree = self.tree.lock().await;
        tree.by_path
            .get(path)
            .and_then(|id| tree.nodes.get(id))
            .cloned()
            .ok_or_else(|| ProviderError::not_found(path))
    }

    async fn children(&self, node: &Node) -> Result<Vec<Node>, ProviderError> {
        let tree = self.tree.lock().await;
        let prefix = if node.path == "/" {
            "/".to_string()
        } else {
            format!("{}/", node.path)
        };
        Ok(tree
            .nodes
            .values()
            .filter(|n| {
                n.path != node.path
                    && n.path.starts_with(&prefix)
                    && !n.path[prefix.len()..].contains('/')
            })
            .cloned()
            .collect())
    }

    async fn create_folder(&self, name: &str, parent: &Node) -> Result<Node, ProviderError> {
        let mut tree = self.tree.lock().await;
        let path = if parent.path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", parent.path)
        };
        let id = tree.allocate_id();
        let node = Node {
            id,
            path: path.clone(),
            is_folder: true,
            size: 0,
            is_exported: false,
        };
        tree.by_path.insert(path, id);
        tree.nodes.insert(id, node.clone());
        Ok(node)
    }

    async fn rename(&self, node: &Node, new_name: &str) -> Result<(), ProviderError> {
        let mut tree = self.tree.lock().await;
        let parent = node
            .path
            .rsplit_once('/')
            .map(|(p, _)| p)
            .unwrap_or_default();
        let new_path = format!("{parent}/{new_name}");
        tree.by_path.remove(&node.path);
        tree.by_path.insert(new_path.clone(), node.id);
        if let Some(n) = tree.nodes.get_mut(&node.id) {
            n.path = new_path;
        }
        Ok(())
    }

    async fn move_node(&self, node: &Node, new_parent: &Node) -> Result<(), ProviderError> {
        let mut tree = self.tree.lock().await;
        let name = node.path.rsplit('/').next().unwrap_or_default().to_string();
        let new_path = if new_parent.path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", new_parent.path)
        };
        tree.by_path.remove(&node.path);
        tree.by_path.insert(new_path.clone(), node.id);
        if let Some(n) = tree.nodes.get_mut(&node.id) {
            n.path = new_path;
        }
        Ok(())
    }

    async fn remove(&self, node: &Node) -> Result<(), ProviderError> {
        let mut tree = self.tree.lock().await;
        tree.by_path.remove(&node.path);
        tree.nodes.remove(&node.id);
        tree.exports.remove(&node.id);
        self.links.revoke_for_path(&node.path);
        Ok(())
    }

    async fn copy_node(&self, node: &Node, new_parent: &Node) -> Result<Node, ProviderError> {
        if self
            .fail_next_import
            .swap(false, Ordering::SeqCst)
        {
            return Err(ProviderError {
                code: 500,
                message: "simulated import failure".to_string(),
                kind: ProviderErrorKind::Other,
            });
        }
        let mut tree = self.tree.lock().await;
        let name = node.path.rsplit('/').next().unwrap_or_default().to_string();
        let new_path = if new_parent.path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", new_parent.path)
        };
        let id = tree.allocate_id();
        let copy = Node {
            id,
            path: new_path.clone(),
            is_folder: node.is_folder,
            size: node.size,
            is_exported: false,
        };
        tree.by_path.insert(new_path, id);
        tree.nodes.insert(id, copy.clone());
        Ok(copy)
    }

    async fn export_node(&self, node: &Node) -> Result<PublicLink, ProviderError> {
        if self.fail_next_export.swap(false, Ordering::SeqCst) {
            return Err(ProviderError {
                code: 500,
                message: "simulated export failure".to_string(),
                kind: ProviderErrorKind::Other,
            });
        }
        let mut tree = self.tree.lock().await;
        if let Some(link) = tree.exports.get(&node.id) {
            return Ok(link.clone());
        }
        let link = self.links.publish(node.clone());
        tree.exports.insert(node.id, link.clone());
        if let Some(n) = tree.nodes.get_mut(&node.id) {
            n.is_exported = true;
        }
        Ok(link)
    }

    async fn disable_export(&self, node: &Node) -> Result<(), ProviderError> {
        let mut tree = self.tree.lock().await;
        tree.exports.remove(&node.id);
        self.links.revoke_for_path(&node.path);
        if let Some(n) = tree.nodes.get_mut(&node.id) {
            n.is_exported = false;
        }
        Ok(())
    }

    async fn public_node_for_link(&self, link: &PublicLink) -> Result<Node, ProviderError> {
        self.links
            .resolve(link)
            .ok_or_else(|| ProviderError::not_found(&link.0))
    }

    async fn start_upload(
        &self,
        _local_path: &str,
        _parent: &Node,
    ) -> Result<TransferHandle, ProviderError> {
        Ok(TransferHandle(
            self.next_transfer.fetch_add(1, Ordering::Relaxed),
        ))
    }

    async fn start_download(
        &self,
        _node: &Node,
        _local_path: &str,
    ) -> Result<TransferHandle, ProviderError> {
        Ok(TransferHandle(
            self.next_transfer.fetch_add(1, Ordering::Relaxed),
        ))
    }

    async fn cancel_transfer(&self, _handle: &TransferHandle) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn account_details(&self) -> Result<AccountDetails, ProviderError> {
        let tree = self.tree.lock().await;
        let used: u64 = tree.nodes.values().map(|n| n.size).sum();
        Ok(AccountDetails {
            storage_used: used,
            storage_total: 20 * 1024 * 1024 * 1024,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn export_then_import_across_accounts() {
        let links = PublicLinkRegistry::new();
        let source = MockProviderClient::new("source@example.com", links.clone());
        let target = MockProviderClient::new("target@example.com", links);

        source.seed_file("/docs/a.txt", 42).await;
        let node = source.node_by_path("/docs/a.txt").await.unwrap();
        let link = source.export_node(&node).await.unwrap();

        let imported = target.public_node_for_link(&link).await.unwrap();
        assert_eq!(imported.path, "/docs/a.txt");

        let root = target.root().await.unwrap();
        let copy = target.copy_node(&imported, &root).await.unwrap();
        assert_eq!(copy.path, "/a.txt");
    }

    #[tokio::test]
    async fn disable_export_removes_link() {
        let links = PublicLinkRegistry::new();
        let client = MockProviderClient::new("acc@example.com", links);
        client.seed_file("/f.bin", 10).await;
        let node = client.node_by_path("/f.bin").await.unwrap();
        let link = client.export_node(&node).await.unwrap();
        client.disable_export(&node).await.unwrap();
        assert!(client.public_node_for_link(&link).await.is_err());
    }
}
