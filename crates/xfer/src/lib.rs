#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `xfer` implements component C6, the hardest subsystem in the
//! workspace: it turns "copy/move these paths from account A to account
//! B" into a sequence of asynchronous SDK requests against two
//! independent [`sessions::SessionPool`] handles, staying correct under
//! cancellation, retries, and partial failure.
//!
//! # Design
//!
//! [`CrossAccountEngine`] holds one [`TransferTask`] per in-flight
//! transfer in a [`dashmap::DashMap`], each guarded by its own
//! `tokio::sync::Mutex` so unrelated transfers never block each other.
//! Admitted transfer ids flow through an unbounded `tokio::sync::mpsc`
//! queue shared by a configurable number of worker loops (default 2);
//! workers `await` the channel rather than block a thread, so the queue
//! is never held across an SDK suspension point. Each worker runs the
//! three-phase pipeline (export, import, cleanup) as a single async
//! function rather than a hand-rolled step enum — `current_step` on
//! [`TransferTask`] is retained purely as an observability field, not as
//! control flow, since Rust's `async`/`await` already gives step N
//! visibility into every side effect of step N-1.
//!
//! # Invariants
//!
//! - `source_account_id != target_account_id` is enforced at admission.
//! - A transfer in `InProgress` is owned by exactly one worker.
//! - Exports the engine itself creates in the export phase are always
//!   disabled during cleanup, on every exit path (success, failure, or
//!   cancellation).
//! - Exactly one of `transfer_completed` / `transfer_failed` /
//!   `transfer_cancelled` is emitted per transfer.
//!
//! # Errors
//!
//! See [`XferError`], matching §4.5.5 of the specification:
//! `SourceUnavailable`, `TargetUnavailable`, `SourceNotFound`,
//! `ExportFailed`, `ImportFailed`, `Cancelled`, `Internal`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use sdk::{Node, PublicLink, ProviderClient, ProviderError};
use sessions::SessionPool;
use tokio::sync::{broadcast, mpsc, Mutex};
use translog::{CrossAccountTransfer, TransferLogStore, TransferOperation, TransferStatus};

const SESSION_WAIT: Duration = Duration::from_secs(60);
const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);
const LINK_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const IMPORT_TIMEOUT: Duration = Duration::from_secs(120);
const DELETE_TIMEOUT: Duration = Duration::from_secs(10);
const DISABLE_EXPORT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_WORKER_COUNT: usize = 2;
const MAX_RETRIES: u32 = 3;

/// Errors surfaced by the transfer engine, per §4.5.5 of the
/// specification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum XferError {
    /// The source session did not become ready within the wait window.
    #[error("source account session not ready")]
    SourceUnavailable,

    /// The target session did not become ready within the wait window.
    #[error("target account session not ready")]
    TargetUnavailable,

    /// A source path does not resolve to a node.
    #[error("source path not found: {0}")]
    SourceNotFound(String),

    /// The SDK returned an error exporting a source node.
    #[error("failed to export from source: {0}")]
    ExportFailed(ProviderError),

    /// Every file in the batch failed to import.
    #[error("failed to import any files to target account")]
    ImportFailed,

    /// The user cancelled the transfer.
    #[error("transfer was cancelled")]
    Cancelled,

    /// An invariant was violated; indicates an engine bug, not user
    /// error.
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl XferError {
    /// Whether a fresh `retry()` is meaningful for this failure kind.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable
                | Self::TargetUnavailable
                | Self::ExportFailed(_)
                | Self::ImportFailed
        )
    }

    fn provider_code(&self) -> Option<i32> {
        match self {
            Self::ExportFailed(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Rejections raised before a transfer is ever enqueued.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    /// `source_paths` was empty.
    #[error("source_paths must not be empty")]
    EmptyPaths,

    /// Source and target account were the same id.
    #[error("source and target account must differ")]
    SameAccount,

    /// Either account id was empty.
    #[error("account id must not be empty")]
    EmptyAccountId,
}

/// Result of a [`CrossAccountEngine::move_files`] admission check.
#[derive(Debug, Clone)]
pub enum MoveOutcome {
    /// The transfer was admitted and enqueued.
    Enqueued(String),
    /// At least one source path has an existing public link and
    /// `skip_link_warning` was `false`; nothing was enqueued.
    SharedLinksWillBreak {
        /// Every source path that is currently exported.
        paths_with_links: Vec<String>,
    },
}

/// Engine-internal augmentation of a persisted [`CrossAccountTransfer`],
/// per §3 of the specification. Never persisted directly; `translog`
/// owns the durable row.
#[derive(Debug, Clone)]
pub struct TransferTask {
    /// The persisted record this task is driving.
    pub record: CrossAccountTransfer,
    /// `0..=3`, retained for observability only.
    pub current_step: u8,
    /// Public links obtained in the export phase, in source-path order.
    pub temp_links: Vec<(String, PublicLink)>,
    /// Source paths whose export was created by this engine (and must
    /// therefore be disabled during cleanup).
    pub newly_exported_paths: HashSet<String>,
    /// Index into `record.source_paths` the export phase has reached,
    /// so a cancelled-and-resumed task would not redo finished work.
    pub current_file_index: usize,
}

/// Events broadcast by the engine, per §6 of the specification.
#[derive(Debug, Clone)]
pub enum XferEvent {
    /// A transfer has started running its pipeline.
    Started(CrossAccountTransfer),
    /// Progress within a running transfer.
    Progress {
        /// Transfer id.
        id: String,
        /// Overall percent complete, `0..=100`.
        percent: u8,
        /// Bytes transferred so far.
        bytes_transferred: u64,
        /// Estimated total bytes.
        bytes_total: u64,
    },
    /// A transfer finished successfully.
    Completed(CrossAccountTransfer),
    /// A transfer finished with a terminal error.
    Failed(CrossAccountTransfer),
    /// A transfer was cancelled.
    Cancelled(String),
    /// Admission refused a `move` because it would break existing
    /// public shares.
    SharedLinksWillBreak {
        /// Every requested source path.
        source_paths: Vec<String>,
        /// The subset currently exported.
        paths_with_links: Vec<String>,
        /// Source account id.
        source_id: String,
        /// Target account id.
        target_id: String,
        /// Requested destination folder.
        target_path: String,
    },
    /// An account's "syncing" badge should change.
    SyncStatusChanged {
        /// The account affected.
        account_id: String,
        /// Whether it is now participating in an active transfer.
        syncing: bool,
    },
}

/// Queues, executes, retries, and cancels cross-account transfers.
pub struct CrossAccountEngine {
    sessions: Arc<SessionPool>,
    log: TransferLogStore,
    tasks: DashMap<String, Arc<Mutex<TransferTask>>>,
    cancelled: DashMap<String, Arc<AtomicBool>>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    events: broadcast::Sender<XferEvent>,
    syncing: DashMap<String, u32>,
}

impl CrossAccountEngine {
    /// Creates an engine over `sessions` and `log`. Call
    /// [`CrossAccountEngine::spawn_workers`] to start draining the
    /// queue.
    #[must_use]
    pub fn new(sessions: Arc<SessionPool>, log: TransferLogStore) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events, _rx) = broadcast::channel(512);
        Arc::new(Self {
            sessions,
            log,
            tasks: DashMap::new(),
            cancelled: DashMap::new(),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            events,
            syncing: DashMap::new(),
        })
    }

    /// Subscribes to engine events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<XferEvent> {
        self.events.subscribe()
    }

    /// Starts `count` worker loops draining the admission queue.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) {
        for _ in 0..count.max(1) {
            let engine = self.clone();
            tokio::spawn(async move {
                loop {
                    let id = {
                        let mut rx = engine.queue_rx.lock().await;
                        rx.recv().await
                    };
                    match id {
                        Some(id) => engine.run_task(id).await,
                        None => break,
                    }
                }
            });
        }
    }

    /// Starts the default worker count.
    pub fn spawn_default_workers(self: &Arc<Self>) {
        self.spawn_workers(DEFAULT_WORKER_COUNT);
    }

    /// Whether `account_id` is currently flagged as syncing because it
    /// is an endpoint of an active transfer.
    #[must_use]
    pub fn is_syncing(&self, account_id: &str) -> bool {
        self.syncing.get(account_id).map(|c| *c > 0).unwrap_or(false)
    }

    /// Admits and enqueues a copy from `source` to `target`.
    pub async fn copy(
        &self,
        paths: Vec<String>,
        source: &str,
        target: &str,
        target_path: &str,
    ) -> Result<String, AdmissionError> {
        self.check_admission(&paths, source, target)?;
        let id = self
            .admit(paths, source, target, target_path, TransferOperation::Copy)
            .await;
        Ok(id)
    }

    /// Admits and enqueues a move from `source` to `target`, unless an
    /// existing public share would be broken and `skip_link_warning` is
    /// `false`.
    pub async fn move_files(
        &self,
        paths: Vec<String>,
        source: &str,
        target: &str,
        target_path: &str,
        skip_link_warning: bool,
    ) -> Result<MoveOutcome, AdmissionError> {
        self.check_admission(&paths, source, target)?;

        if !skip_link_warning {
            let client = match self.sessions.get_session(source) {
                Some(client) => Some(client),
                None => match self.sessions.ensure_session(source).await {
                    Ok(client) => Some(client),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            account_id = source,
                            "could not bring up source session to check for existing public links before move"
                        );
                        None
                    }
                },
            };

            if let Some(client) = client {
                let mut paths_with_links = Vec::new();
                for path in &paths {
                    if let Ok(node) = client.node_by_path(path).await {
                        if node.is_exported {
                            paths_with_links.push(path.clone());
                        }
                    }
                }
                if !paths_with_links.is_empty() {
                    let _ = self.events.send(XferEvent::SharedLinksWillBreak {
                        source_paths: paths.clone(),
                        paths_with_links: paths_with_links.clone(),
                        source_id: source.to_string(),
                        target_id: target.to_string(),
                        target_path: target_path.to_string(),
                    });
                    return Ok(MoveOutcome::SharedLinksWillBreak { paths_with_links });
                }
            }
        }

        let id = self
            .admit(paths, source, target, target_path, TransferOperation::Move)
            .await;
        Ok(MoveOutcome::Enqueued(id))
    }

    fn check_admission(
        &self,
        paths: &[String],
        source: &str,
        target: &str,
    ) -> Result<(), AdmissionError> {
        if source.is_empty() || target.is_empty() {
            return Err(AdmissionError::EmptyAccountId);
        }
        if source == target {
            return Err(AdmissionError::SameAccount);
        }
        if paths.is_empty() {
            return Err(AdmissionError::EmptyPaths);
        }
        Ok(())
    }

    async fn admit(
        &self,
        paths: Vec<String>,
        source: &str,
        target: &str,
        target_path: &str,
        operation: TransferOperation,
    ) -> String {
        let (bytes_total, files_total) = self.estimate_totals(source, &paths).await;
        let id = translog::new_transfer_id();
        let record = CrossAccountTransfer {
            id: id.clone(),
            timestamp: now_secs(),
            source_account_id: source.to_string(),
            source_paths: paths,
            target_account_id: target.to_string(),
            target_path: target_path.to_string(),
            operation,
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            bytes_total,
            files_transferred: 0,
            files_total,
            start_time: None,
            end_time: None,
            error_message: String::new(),
            error_code: None,
            retry_count: 0,
            can_retry: true,
        };

        let _ = self.log.log(record.clone()).await;
        self.cancelled
            .insert(id.clone(), Arc::new(AtomicBool::new(false)));
        self.tasks.insert(
            id.clone(),
            Arc::new(Mutex::new(TransferTask {
                record,
                current_step: 0,
                temp_links: Vec::new(),
                newly_exported_paths: HashSet::new(),
                current_file_index: 0,
            })),
        );
        let _ = self.queue_tx.send(id.clone());
        id
    }

    async fn estimate_totals(&self, source: &str, paths: &[String]) -> (u64, u32) {
        let Ok(client) =
            tokio::time::timeout(SESSION_WAIT, self.sessions.ensure_session(source)).await
        else {
            return (0, paths.len() as u32);
        };
        let Ok(client) = client else {
            return (0, paths.len() as u32);
        };

        let mut bytes = 0u64;
        let mut files = 0u32;
        for path in paths {
            let Ok(node) = client.node_by_path(path).await else {
                continue;
            };
            if node.is_folder {
                if let Ok(children) = client.children(&node).await {
                    for child in children {
                        if !child.is_folder {
                            bytes += child.size;
                            files += 1;
                        }
                    }
                }
            } else {
                bytes += node.size;
                files += 1;
            }
        }
        (bytes, files.max(1))
    }

    /// Marks a running transfer for cancellation. Already-issued SDK
    /// calls are allowed to finish; the next boundary observes the flag.
    pub fn cancel(&self, id: &str) {
        if let Some(flag) = self.cancelled.get(id) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Retries a `Failed` transfer whose `can_retry` is `true`, creating
    /// a fresh transfer record. Returns `None` if the original is not
    /// eligible.
    pub async fn retry(&self, id: &str) -> Option<String> {
        let original = self.log.get(id).await.ok()??;
        if original.status != TransferStatus::Failed || !original.can_retry {
            return None;
        }

        let new_id = translog::new_transfer_id();
        let record = CrossAccountTransfer {
            id: new_id.clone(),
            timestamp: now_secs(),
            retry_count: original.retry_count + 1,
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            files_transferred: 0,
            start_time: None,
            end_time: None,
            error_message: String::new(),
            error_code: None,
            can_retry: true,
            ..original
        };

        let _ = self.log.log(record.clone()).await;
        self.cancelled
            .insert(new_id.clone(), Arc::new(AtomicBool::new(false)));
        self.tasks.insert(
            new_id.clone(),
            Arc::new(Mutex::new(TransferTask {
                record,
                current_step: 0,
                temp_links: Vec::new(),
                newly_exported_paths: HashSet::new(),
                current_file_index: 0,
            })),
        );
        let _ = self.queue_tx.send(new_id.clone());
        Some(new_id)
    }

    fn is_cancelled(&self, id: &str) -> bool {
        self.cancelled
            .get(id)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn enter_syncing(&self, account_id: &str) {
        let mut count = self.syncing.entry(account_id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            let _ = self.events.send(XferEvent::SyncStatusChanged {
                account_id: account_id.to_string(),
                syncing: true,
            });
        }
    }

    fn leave_syncing(&self, account_id: &str) {
        if let Some(mut count) = self.syncing.get_mut(account_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                let _ = self.events.send(XferEvent::SyncStatusChanged {
                    account_id: account_id.to_string(),
                    syncing: false,
                });
            }
        }
    }

    async fn run_task(&self, id: String) {
        let Some(task) = self.tasks.get(&id).map(|r| r.clone()) else {
            return;
        };

        let (source_id, target_id) = {
            let t = task.lock().await;
            (
                t.record.source_account_id.clone(),
                t.record.target_account_id.clone(),
            )
        };

        {
            let mut t = task.lock().await;
            t.record.status = TransferStatus::InProgress;
            t.record.start_time = Some(now_secs());
        }
        self.enter_syncing(&source_id);
        self.enter_syncing(&target_id);
        let started = task.lock().await.record.clone();
        let _ = self.log.update(started.clone()).await;
        let _ = self.events.send(XferEvent::Started(started));

        let result = self.run_pipeline(&id, &task).await;
        self.run_cleanup(&task, &result).await;

        match result {
            Ok(()) => self.finish_completed(&task).await,
            Err(XferError::Cancelled) => self.finish_cancelled(&id, &task).await,
            Err(e) => self.finish_failed(&task, e).await,
        }

        self.leave_syncing(&source_id);
        self.leave_syncing(&target_id);
        self.tasks.remove(&id);
        self.cancelled.remove(&id);
    }

    async fn run_pipeline(
        &self,
        id: &str,
        task: &Arc<Mutex<TransferTask>>,
    ) -> Result<(), XferError> {
        self.step_export(id, task).await?;
        if self.is_cancelled(id) {
            return Err(XferError::Cancelled);
        }
        task.lock().await.current_step = 1;
        self.step_import(task).await?;
        task.lock().await.current_step = 2;
        Ok(())
    }

    async fn step_export(
        &self,
        id: &str,
        task: &Arc<Mutex<TransferTask>>,
    ) -> Result<(), XferError> {
        let (source_id, paths) = {
            let t = task.lock().await;
            (t.record.source_account_id.clone(), t.record.source_paths.clone())
        };

        let client = tokio::time::timeout(SESSION_WAIT, self.sessions.ensure_session(&source_id))
            .await
            .map_err(|_| XferError::SourceUnavailable)?
            .map_err(|_| XferError::SourceUnavailable)?;
        self.sessions.mark_in_use(&source_id).await;

        let start_index = task.lock().await.current_file_index;
        let outcome = self
            .export_loop(id, task, client.as_ref(), &paths, start_index)
            .await;

        self.sessions.mark_idle(&source_id).await;
        outcome
    }

    async fn export_loop(
        &self,
        id: &str,
        task: &Arc<Mutex<TransferTask>>,
        client: &dyn ProviderClient,
        paths: &[String],
        start_index: usize,
    ) -> Result<(), XferError> {
        let total = paths.len();
        for idx in start_index..total {
            if self.is_cancelled(id) {
                return Err(XferError::Cancelled);
            }
            let path = &paths[idx];
            let node = client
                .node_by_path(path)
                .await
                .map_err(|_| XferError::SourceNotFound(path.clone()))?;

            let newly_exported = !node.is_exported;
            let link = tokio::time::timeout(EXPORT_TIMEOUT, client.export_node(&node))
                .await
                .map_err(|_| {
                    XferError::ExportFailed(timeout_error("export_node"))
                })?
                .map_err(XferError::ExportFailed)?;

            {
                let mut t = task.lock().await;
                t.temp_links.push((path.clone(), link));
                if newly_exported {
                    t.newly_exported_paths.insert(path.clone());
                }
                t.current_file_index = idx + 1;
            }

            let percent = (((idx + 1) as f64 / total as f64) * 100.0 / 3.0).floor() as u8;
            self.emit_progress(task, percent).await;
        }
        Ok(())
    }

    async fn step_import(&self, task: &Arc<Mutex<TransferTask>>) -> Result<(), XferError> {
        let (target_id, target_path, links) = {
            let t = task.lock().await;
            (
                t.record.target_account_id.clone(),
                t.record.target_path.clone(),
                t.temp_links.clone(),
            )
        };

        let client = tokio::time::timeout(SESSION_WAIT, self.sessions.ensure_session(&target_id))
            .await
            .map_err(|_| XferError::TargetUnavailable)?
            .map_err(|_| XferError::TargetUnavailable)?;
        self.sessions.mark_in_use(&target_id).await;

        let target_folder = resolve_target_folder(client.as_ref(), &target_path).await;

        let total = links.len().max(1);
        let mut success = 0usize;
        for (i, (_path, link)) in links.iter().enumerate() {
            if self.is_cancelled(&task.lock().await.record.id) {
                break;
            }
            match self.import_one(client.as_ref(), link, &target_folder).await {
                Ok(()) => success += 1,
                Err(e) => tracing::warn!(error = %e, "failed to import one file to target account"),
            }
            let percent = 33 + (((i + 1) as f64 / total as f64) * 67.0).floor() as u8;
            self.emit_progress(task, percent.min(100)).await;
        }

        self.sessions.mark_idle(&target_id).await;

        if success == 0 {
            return Err(XferError::ImportFailed);
        }
        if success < links.len() {
            tracing::warn!(
                success,
                total = links.len(),
                "partial import: some files failed to copy into target account"
            );
        }

        let mut t = task.lock().await;
        t.record.files_transferred = success as u32;
        t.record.bytes_transferred = t.record.bytes_total;
        Ok(())
    }

    async fn import_one(
        &self,
        client: &dyn ProviderClient,
        link: &PublicLink,
        target_folder: &Node,
    ) -> Result<(), ProviderError> {
        let public_node = tokio::time::timeout(LINK_FETCH_TIMEOUT, client.public_node_for_link(link))
            .await
            .map_err(|_| timeout_error("public_node_for_link"))??;
        tokio::time::timeout(IMPORT_TIMEOUT, client.copy_node(&public_node, target_folder))
            .await
            .map_err(|_| timeout_error("copy_node"))??;
        Ok(())
    }

    async fn run_cleanup(&self, task: &Arc<Mutex<TransferTask>>, outcome: &Result<(), XferError>) {
        let (source_id, operation, newly_exported, source_paths) = {
            let t = task.lock().await;
            (
                t.record.source_account_id.clone(),
                t.record.operation,
                t.newly_exported_paths.clone(),
                t.record.source_paths.clone(),
            )
        };

        let client = match self.sessions.get_session(&source_id) {
            Some(c) => c,
            None => match self.sessions.ensure_session(&source_id).await {
                Ok(c) => c,
                Err(_) => return,
            },
        };

        let full_cleanup = outcome.is_ok();

        if full_cleanup && matches!(operation, TransferOperation::Move) {
            for path in &source_paths {
                let Ok(node) = client.node_by_path(path).await else {
                    continue;
                };
                if newly_exported.contains(path) {
                    let _ = tokio::time::timeout(DISABLE_EXPORT_TIMEOUT, client.disable_export(&node))
                        .await;
                }
                let _ = tokio::time::timeout(DELETE_TIMEOUT, client.remove(&node)).await;
            }
        } else {
            for path in &newly_exported {
                if let Ok(node) = client.node_by_path(path).await {
                    let _ = tokio::time::timeout(DISABLE_EXPORT_TIMEOUT, client.disable_export(&node))
                        .await;
                }
            }
        }
    }

    async fn emit_progress(&self, task: &Arc<Mutex<TransferTask>>, percent: u8) {
        let (id, bytes_transferred, bytes_total) = {
            let t = task.lock().await;
            (t.record.id.clone(), t.record.bytes_transferred, t.record.bytes_total)
        };
        let _ = self.events.send(XferEvent::Progress {
            id,
            percent: percent.min(100),
            bytes_transferred,
            bytes_total,
        });
    }

    async fn finish_completed(&self, task: &Arc<Mutex<TransferTask>>) {
        let record = {
            let mut t = task.lock().await;
            t.record.status = TransferStatus::Completed;
            t.record.end_time = Some(now_secs());
            t.current_step = 3;
            t.record.clone()
        };
        let _ = self.log.update(record.clone()).await;
        tracing::info!(id = %record.id, "transfer completed");
        let _ = self.events.send(XferEvent::Completed(record));
    }

    async fn finish_cancelled(&self, id: &str, task: &Arc<Mutex<TransferTask>>) {
        {
            let mut t = task.lock().await;
            t.record.status = TransferStatus::Cancelled;
            t.record.end_time = Some(now_secs());
            let record = t.record.clone();
            drop(t);
            let _ = self.log.update(record).await;
        }
        let _ = self.events.send(XferEvent::Cancelled(id.to_string()));
    }

    async fn finish_failed(&self, task: &Arc<Mutex<TransferTask>>, error: XferError) {
        let record = {
            let mut t = task.lock().await;
            t.record.status = TransferStatus::Failed;
            t.record.end_time = Some(now_secs());
            t.record.error_message = error.to_string();
            t.record.error_code = error.provider_code();
            t.record.can_retry = t.record.retry_count < MAX_RETRIES && error.retryable();
            t.record.clone()
        };
        let _ = self.log.update(record.clone()).await;
        tracing::warn!(id = %record.id, error = %error, "transfer failed");
        let _ = self.events.send(XferEvent::Failed(record));
    }
}

async fn resolve_target_folder(client: &dyn ProviderClient, target_path: &str) -> Node {
    match client.node_by_path(target_path).await {
        Ok(node) => node,
        Err(_) => client
            .root()
            .await
            .expect("mock/provider root() must always succeed"),
    }
}

fn timeout_error(call: &str) -> ProviderError {
    ProviderError {
        code: 0,
        message: format!("{call} timed out"),
        kind: sdk::ProviderErrorKind::Network,
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::{MockProviderClient, PublicLinkRegistry};

    /// Hands out one `MockProviderClient` per account id and remembers
    /// it, so tests can seed files on the exact instance the engine will
    /// end up using.
    struct Factory {
        links: PublicLinkRegistry,
        created: DashMap<String, Arc<MockProviderClient>>,
    }

    impl sessions::ClientFactory for Factory {
        fn create_client(&self, account_id: &str) -> Arc<dyn ProviderClient> {
            let client = Arc::new(MockProviderClient::new(account_id, self.links.clone()));
            self.created.insert(account_id.to_string(), client.clone());
            client
        }
    }

    struct StaticTokens;
    impl sessions::TokenSource for StaticTokens {
        fn session_token(&self, account_id: &str) -> Option<String> {
            Some(format!("tok-{account_id}"))
        }
    }

    struct Fixture {
        engine: Arc<CrossAccountEngine>,
        sessions: Arc<SessionPool>,
        factory: Arc<Factory>,
    }

    impl Fixture {
        /// Forces `account`'s session into existence, then seeds a file
        /// on its backing mock.
        async fn seed(&self, account: &str, path: &str, size: u64) {
            self.sessions.ensure_session(account).await.unwrap();
            let mock = self
                .factory
                .created
                .get(account)
                .expect("ensure_session must have called create_client");
            mock.seed_file(path, size).await;
        }

        async fn wait_terminal(&self, events: &mut broadcast::Receiver<XferEvent>) -> XferEvent {
            loop {
                match events.recv().await.unwrap() {
                    e @ (XferEvent::Completed(_) | XferEvent::Failed(_) | XferEvent::Cancelled(_)) => {
                        return e
                    }
                    _ => continue,
                }
            }
        }
    }

    async fn fixture() -> Fixture {
        let factory = Arc::new(Factory {
            links: PublicLinkRegistry::new(),
            created: DashMap::new(),
        });
        let sessions = Arc::new(SessionPool::new(factory.clone(), Arc::new(StaticTokens)));
        let log = TransferLogStore::open_in_memory().unwrap();
        let engine = CrossAccountEngine::new(sessions.clone(), log);
        engine.spawn_default_workers();
        Fixture {
            engine,
            sessions,
            factory,
        }
    }

    #[tokio::test]
    async fn admission_rejects_empty_paths() {
        let f = fixture().await;
        let err = f
            .engine
            .copy(vec![], "acc-s", "acc-t", "/inbox")
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::EmptyPaths));
    }

    #[tokio::test]
    async fn admission_rejects_same_account() {
        let f = fixture().await;
        let err = f
            .engine
            .copy(vec!["/a.txt".into()], "acc-s", "acc-s", "/inbox")
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::SameAccount));
    }

    #[tokio::test]
    async fn copy_happy_path_completes() {
        let f = fixture().await;
        f.seed("acc-s", "/docs/a.txt", 42).await;

        let mut events = f.engine.subscribe();
        let id = f
            .engine
            .copy(vec!["/docs/a.txt".into()], "acc-s", "acc-t", "/inbox")
            .await
            .unwrap();

        let event = f.wait_terminal(&mut events).await;
        assert!(matches!(event, XferEvent::Completed(_)));

        let stored = f.engine.log.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Completed);
        assert_eq!(stored.files_transferred, 1);
        assert_eq!(stored.error_message, "");

        let target = f.factory.created.get("acc-t").unwrap();
        assert!(target.node_by_path("/a.txt").await.is_ok());

        let source = f.factory.created.get("acc-s").unwrap();
        let node = source.node_by_path("/docs/a.txt").await.unwrap();
        assert!(!node.is_exported);
    }

    #[tokio::test]
    async fn missing_source_path_fails_immediately() {
        let f = fixture().await;
        f.sessions.ensure_session("acc-s").await.unwrap();

        let mut events = f.engine.subscribe();
        let id = f
            .engine
            .copy(vec!["/does-not-exist.txt".into()], "acc-s", "acc-t", "/inbox")
            .await
            .unwrap();

        let event = f.wait_terminal(&mut events).await;
        assert!(matches!(event, XferEvent::Failed(_)));
        let stored = f.engine.log.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Failed);
        assert!(!stored.can_retry || stored.retry_count < MAX_RETRIES);
    }

    #[tokio::test]
    async fn move_with_existing_share_is_blocked_without_skip() {
        let f = fixture().await;
        f.seed("acc-s", "/reports/r.pdf", 10).await;
        let source = f.factory.created.get("acc-s").unwrap();
        let node = source.node_by_path("/reports/r.pdf").await.unwrap();
        source.export_node(&node).await.unwrap();

        let mut events = f.engine.subscribe();
        let outcome = f
            .engine
            .move_files(
                vec!["/reports/r.pdf".into()],
                "acc-s",
                "acc-t",
                "/archive",
                false,
            )
            .await
            .unwrap();

        match outcome {
            MoveOutcome::SharedLinksWillBreak { paths_with_links } => {
                assert_eq!(paths_with_links, vec!["/reports/r.pdf".to_string()]);
            }
            MoveOutcome::Enqueued(_) => panic!("expected SharedLinksWillBreak"),
        }

        match events.try_recv().unwrap() {
            XferEvent::SharedLinksWillBreak { source_id, target_id, .. } => {
                assert_eq!(source_id, "acc-s");
                assert_eq!(target_id, "acc-t");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn move_with_existing_share_skipped_completes_and_deletes_source() {
        let f = fixture().await;
        f.seed("acc-s", "/reports/r.pdf", 10).await;
        let source = f.factory.created.get("acc-s").unwrap();
        let node = source.node_by_path("/reports/r.pdf").await.unwrap();
        source.export_node(&node).await.unwrap();

        let mut events = f.engine.subscribe();
        let outcome = f
            .engine
            .move_files(
                vec!["/reports/r.pdf".into()],
                "acc-s",
                "acc-t",
                "/archive",
                true,
            )
            .await
            .unwrap();
        let MoveOutcome::Enqueued(id) = outcome else {
            panic!("expected Enqueued");
        };

        let event = f.wait_terminal(&mut events).await;
        assert!(matches!(event, XferEvent::Completed(_)));
        let stored = f.engine.log.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Completed);
        assert!(source.node_by_path("/reports/r.pdf").await.is_err());
    }

    #[tokio::test]
    async fn total_import_failure_still_cleans_up_new_exports() {
        let f = fixture().await;
        f.seed("acc-s", "/a.txt", 5).await;
        f.sessions.ensure_session("acc-t").await.unwrap();
        let target = f.factory.created.get("acc-t").unwrap();
        target.fail_next_import.store(true, Ordering::SeqCst);

        let mut events = f.engine.subscribe();
        let id = f
            .engine
            .copy(vec!["/a.txt".into()], "acc-s", "acc-t", "/inbox")
            .await
            .unwrap();

        let event = f.wait_terminal(&mut events).await;
        assert!(matches!(event, XferEvent::Failed(_)));
        let stored = f.engine.log.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.error_message, XferError::ImportFailed.to_string());

        let source = f.factory.created.get("acc-s").unwrap();
        let node = source.node_by_path("/a.txt").await.unwrap();
        assert!(!node.is_exported, "newly-created export must be disabled on total failure");
    }

    #[tokio::test]
    async fn cancel_flag_is_observable_once_set() {
        let f = fixture().await;
        f.engine
            .copy(vec!["/a.txt".into()], "acc-s", "acc-t", "/inbox")
            .await
            .unwrap();
        let ids: Vec<String> = f.engine.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            f.engine.cancel(&id);
            assert!(f.engine.is_cancelled(&id));
        }
    }

    #[tokio::test]
    async fn retry_requires_failed_and_can_retry() {
        let f = fixture().await;
        let missing = f.engine.retry("xfr-ghost").await;
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn retry_after_failure_creates_new_transfer_with_incremented_count() {
        let f = fixture().await;
        f.sessions.ensure_session("acc-s").await.unwrap();

        let mut events = f.engine.subscribe();
        let id = f
            .engine
            .copy(vec!["/missing.txt".into()], "acc-s", "acc-t", "/inbox")
            .await
            .unwrap();
        f.wait_terminal(&mut events).await;

        let retried = f.engine.retry(&id).await.expect("original is retryable");
        assert_ne!(retried, id);
        let new_record = f.engine.log.get(&retried).await.unwrap().unwrap();
        assert_eq!(new_record.retry_count, 1);
    }
}
