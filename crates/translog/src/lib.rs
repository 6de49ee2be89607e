#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `translog` implements component C5: a persistent, queryable history of
//! every cross-account transfer, backed by a single SQLite table. Rows
//! mirror [`CrossAccountTransfer`] one-to-one.
//!
//! # Design
//!
//! [`TransferLogStore`] wraps one `rusqlite` connection behind a
//! `std::sync::Mutex`, opened in WAL journal mode so readers are not
//! blocked behind an in-flight writer at the OS level. Every public
//! operation is `async` and runs its SQL on a blocking-pool thread via
//! [`tokio::task::spawn_blocking`], matching the way the rest of this
//! workspace keeps its public surface `async` even where the underlying
//! work is synchronous. Schema creation runs on [`TransferLogStore::open`]
//! with `CREATE TABLE IF NOT EXISTS`, so opening an existing database is
//! idempotent.
//!
//! # Invariants
//!
//! - `log(t)` followed by `get(t.id)` returns a row equal to `t`.
//! - `update(t)` after `log(t)` replaces the stored row in place; the
//!   primary key never changes.
//! - One event (`logged`, `updated`, or `deleted`) is broadcast per
//!   mutation.
//!
//! # Errors
//!
//! See [`TransferLogError`]: `DatabaseFailed`, `NotInitialized`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio::sync::broadcast;

/// Operation requested for a cross-account transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOperation {
    /// Copy: source files remain after the transfer.
    Copy,
    /// Move: source files are removed after a successful import.
    Move,
}

impl TransferOperation {
    fn to_i64(self) -> i64 {
        match self {
            Self::Copy => 0,
            Self::Move => 1,
        }
    }

    fn from_i64(v: i64) -> Self {
        if v == 1 {
            Self::Move
        } else {
            Self::Copy
        }
    }
}

/// Lifecycle status of a cross-account transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Enqueued, not yet picked up by a worker.
    Pending,
    /// A worker is actively running the four-step pipeline.
    InProgress,
    /// Finished successfully (possibly with a partial-import warning).
    Completed,
    /// Finished with a terminal error.
    Failed,
    /// Cancelled by the user before completion.
    Cancelled,
}

impl TransferStatus {
    fn to_i64(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed => 2,
            Self::Failed => 3,
            Self::Cancelled => 4,
        }
    }

    fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::InProgress,
            2 => Self::Completed,
            3 => Self::Failed,
            4 => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    /// `true` once this status admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A persisted record of one cross-account copy or move, per §3 of the
/// specification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossAccountTransfer {
    /// Opaque `"xfr-XXXXXXXX"` identifier, unique per process lifetime.
    pub id: String,
    /// Seconds since the Unix epoch when the transfer was enqueued.
    pub timestamp: i64,
    /// Account the paths are read from.
    pub source_account_id: String,
    /// Absolute paths on the source account, in transfer order.
    pub source_paths: Vec<String>,
    /// Account the paths are written to.
    pub target_account_id: String,
    /// Destination folder path on the target account.
    pub target_path: String,
    /// Whether this is a copy or a move.
    pub operation: TransferOperation,
    /// Current lifecycle status.
    pub status: TransferStatus,
    /// Bytes transferred so far.
    pub bytes_transferred: u64,
    /// Total bytes estimated at admission time.
    pub bytes_total: u64,
    /// Files successfully imported so far.
    pub files_transferred: u32,
    /// Total files estimated at admission time.
    pub files_total: u32,
    /// When the worker began running the pipeline.
    pub start_time: Option<i64>,
    /// When the task reached a terminal status.
    pub end_time: Option<i64>,
    /// Leaf-cause error string; empty when there is no error.
    pub error_message: String,
    /// Provider error code, if the failure came from the SDK.
    pub error_code: Option<i32>,
    /// Number of times this transfer has been retried.
    pub retry_count: u32,
    /// Whether `retry` is still permitted (`false` once `retry_count >= 3`).
    pub can_retry: bool,
}

/// Generates a fresh `"xfr-XXXXXXXX"` transfer id from a random UUID.
#[must_use]
pub fn new_transfer_id() -> String {
    let id = uuid::Uuid::new_v4();
    format!("xfr-{}", &id.simple().to_string()[..8])
}

/// Errors produced by the transfer log store.
#[derive(Debug, thiserror::Error)]
pub enum TransferLogError {
    /// The underlying SQLite operation failed.
    #[error("transfer log database error: {0}")]
    DatabaseFailed(#[from] rusqlite::Error),

    /// A query referenced a row that does not exist.
    #[error("no transfer with id {0}")]
    NotInitialized(String),

    /// The background blocking task panicked or was cancelled.
    #[error("transfer log worker task failed: {0}")]
    JoinFailed(#[from] tokio::task::JoinError),
}

/// Events broadcast on every mutation, for the GUI log panel (or, in this
/// workspace, the CLI's NDJSON event stream) to refresh without polling.
#[derive(Debug, Clone)]
pub enum TransferLogEvent {
    /// A new row was inserted.
    Logged(Box<CrossAccountTransfer>),
    /// An existing row was replaced.
    Updated(Box<CrossAccountTransfer>),
    /// A row was removed.
    Deleted(String),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transfers (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    source_account_id TEXT NOT NULL,
    source_paths TEXT NOT NULL,
    target_account_id TEXT NOT NULL,
    target_path TEXT NOT NULL,
    operation INTEGER NOT NULL,
    status INTEGER NOT NULL,
    bytes_transferred INTEGER NOT NULL,
    bytes_total INTEGER NOT NULL,
    files_transferred INTEGER NOT NULL,
    files_total INTEGER NOT NULL,
    start_time INTEGER,
    end_time INTEGER,
    error_message TEXT NOT NULL,
    error_code INTEGER,
    retry_count INTEGER NOT NULL,
    can_retry INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transfers_timestamp ON transfers(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers(status);
CREATE INDEX IF NOT EXISTS idx_transfers_accounts ON transfers(source_account_id, target_account_id);
";

/// Persistent, queryable history of cross-account transfers.
#[derive(Clone)]
pub struct TransferLogStore {
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<TransferLogEvent>,
}

impl TransferLogStore {
    /// Opens (creating if absent) the database at `path`, applying the
    /// schema idempotently.
    pub fn open(path: &Path) -> Result<Self, TransferLogError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        let (tx, _rx) = broadcast::channel(256);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            events: tx,
        })
    }

    /// Opens an in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, TransferLogError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        let (tx, _rx) = broadcast::channel(256);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            events: tx,
        })
    }

    /// Subscribes to store mutation events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransferLogEvent> {
        self.events.subscribe()
    }

    /// Inserts a new row, broadcasting `Logged`.
    pub async fn log(&self, transfer: CrossAccountTransfer) -> Result<(), TransferLogError> {
        let conn = self.conn.clone();
        let t = transfer.clone();
        tokio::task::spawn_blocking(move || insert_row(&conn, &t)).await??;
        tracing::debug!(id = %transfer.id, "logged transfer");
        let _ = self.events.send(TransferLogEvent::Logged(Box::new(transfer)));
        Ok(())
    }

    /// Replaces an existing row in place, broadcasting `Updated`.
    pub async fn update(&self, transfer: CrossAccountTransfer) -> Result<(), TransferLogError> {
        let conn = self.conn.clone();
        let t = transfer.clone();
        tokio::task::spawn_blocking(move || insert_row(&conn, &t)).await??;
        let _ = self
            .events
            .send(TransferLogEvent::Updated(Box::new(transfer)));
        Ok(())
    }

    /// Fetches a single row by id.
    pub async fn get(&self, id: &str) -> Result<Option<CrossAccountTransfer>, TransferLogError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("transfer log mutex poisoned");
            conn.query_row(
                "SELECT * FROM transfers WHERE id = ?1",
                params![id],
                row_to_transfer,
            )
            .optional()
            .map_err(TransferLogError::from)
        })
        .await?
    }

    /// Fetches rows ordered by timestamp descending, most recent first.
    pub async fn get_all(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CrossAccountTransfer>, TransferLogError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            query_rows(
                &conn,
                "SELECT * FROM transfers ORDER BY timestamp DESC LIMIT ?1 OFFSET ?2",
                params![limit, offset],
            )
        })
        .await?
    }

    /// Fetches rows with the given status, most recent first.
    pub async fn by_status(
        &self,
        status: TransferStatus,
        limit: u32,
    ) -> Result<Vec<CrossAccountTransfer>, TransferLogError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            query_rows(
                &conn,
                "SELECT * FROM transfers WHERE status = ?1 ORDER BY timestamp DESC LIMIT ?2",
                params![status.to_i64(), limit],
            )
        })
        .await?
    }

    /// Fetches rows where `account_id` is either endpoint, most recent
    /// first.
    pub async fn by_account(
        &self,
        account_id: &str,
        limit: u32,
    ) -> Result<Vec<CrossAccountTransfer>, TransferLogError> {
        let conn = self.conn.clone();
        let account_id = account_id.to_string();
        tokio::task::spawn_blocking(move || {
            query_rows(
                &conn,
                "SELECT * FROM transfers WHERE source_account_id = ?1 OR target_account_id = ?1 \
                 ORDER BY timestamp DESC LIMIT ?2",
                params![account_id, limit],
            )
        })
        .await?
    }

    /// Fetches rows whose timestamp falls within `[from, to]`, most
    /// recent first.
    pub async fn by_date_range(
        &self,
        from: i64,
        to: i64,
        limit: u32,
    ) -> Result<Vec<CrossAccountTransfer>, TransferLogError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            query_rows(
                &conn,
                "SELECT * FROM transfers WHERE timestamp BETWEEN ?1 AND ?2 \
                 ORDER BY timestamp DESC LIMIT ?3",
                params![from, to, limit],
            )
        })
        .await?
    }

    /// Substring-matches `query` against source paths, target path, or
    /// either account id, most recent first.
    pub async fn search(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<Vec<CrossAccountTransfer>, TransferLogError> {
        let conn = self.conn.clone();
        let needle = format!("%{query}%");
        tokio::task::spawn_blocking(move || {
            query_rows(
                &conn,
                "SELECT * FROM transfers WHERE source_paths LIKE ?1 OR target_path LIKE ?1 \
                 ORDER BY timestamp DESC LIMIT ?2",
                params![needle, limit],
            )
        })
        .await?
    }

    /// Counts rows grouped by status.
    pub async fn status_counts(&self) -> Result<Vec<(TransferStatus, u64)>, TransferLogError> {
        let conn = self.conn.clone();
        let rows: Vec<(TransferStatus, u64)> = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("transfer log mutex poisoned");
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM transfers GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| {
                    let status: i64 = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    Ok((TransferStatus::from_i64(status), count as u64))
                })?
                .collect::<Result<Vec<_>, rusqlite::Error>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await??;
        Ok(rows)
    }

    /// Removes a single row, broadcasting `Deleted`.
    pub async fn delete(&self, id: &str) -> Result<(), TransferLogError> {
        let conn = self.conn.clone();
        let id_owned = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("transfer log mutex poisoned");
            conn.execute("DELETE FROM transfers WHERE id = ?1", params![id_owned])
        })
        .await??;
        let _ = self.events.send(TransferLogEvent::Deleted(id.to_string()));
        Ok(())
    }

    /// Removes every row older than `timestamp`.
    pub async fn clear_older_than(&self, timestamp: i64) -> Result<u64, TransferLogError> {
        let conn = self.conn.clone();
        let deleted = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("transfer log mutex poisoned");
            conn.execute(
                "DELETE FROM transfers WHERE timestamp < ?1",
                params![timestamp],
            )
        })
        .await??;
        Ok(deleted as u64)
    }

    /// Removes every row in a terminal `Completed` status.
    pub async fn clear_completed(&self) -> Result<u64, TransferLogError> {
        let conn = self.conn.clone();
        let deleted = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("transfer log mutex poisoned");
            conn.execute(
                "DELETE FROM transfers WHERE status = ?1",
                params![TransferStatus::Completed.to_i64()],
            )
        })
        .await??;
        Ok(deleted as u64)
    }

    /// Removes every row.
    pub async fn clear_all(&self) -> Result<(), TransferLogError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("transfer log mutex poisoned");
            conn.execute("DELETE FROM transfers", [])
        })
        .await??;
        Ok(())
    }
}

fn insert_row(conn: &Mutex<Connection>, t: &CrossAccountTransfer) -> Result<(), TransferLogError> {
    let conn = conn.lock().expect("transfer log mutex poisoned");
    let paths = t.source_paths.join("\u{1f}");
    conn.execute(
        "INSERT INTO transfers (
            id, timestamp, source_account_id, source_paths, target_account_id, target_path,
            operation, status, bytes_transferred, bytes_total, files_transferred, files_total,
            start_time, end_time, error_message, error_code, retry_count, can_retry
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)
        ON CONFLICT(id) DO UPDATE SET
            timestamp=excluded.timestamp,
            source_account_id=excluded.source_account_id,
            source_paths=excluded.source_paths,
            target_account_id=excluded.target_account_id,
            target_path=excluded.target_path,
            operation=excluded.operation,
            status=excluded.status,
            bytes_transferred=excluded.bytes_transferred,
            bytes_total=excluded.bytes_total,
            files_transferred=excluded.files_transferred,
            files_total=excluded.files_total,
            start_time=excluded.start_time,
            end_time=excluded.end_time,
            error_message=excluded.error_message,
            error_code=excluded.error_code,
            retry_count=excluded.retry_count,
            can_retry=excluded.can_retry",
        params![
            t.id,
            t.timestamp,
            t.source_account_id,
            paths,
            t.target_account_id,
            t.target_path,
            t.operation.to_i64(),
            t.status.to_i64(),
            t.bytes_transferred as i64,
            t.bytes_total as i64,
            t.files_transferred as i64,
            t.files_total as i64,
            t.start_time,
            t.end_time,
            t.error_message,
            t.error_code,
            t.retry_count as i64,
            t.can_retry as i64,
        ],
    )?;
    Ok(())
}

fn query_rows(
    conn: &Mutex<Connection>,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<CrossAccountTransfer>, TransferLogError> {
    let conn = conn.lock().expect("transfer log mutex poisoned");
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, row_to_transfer)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_transfer(row: &Row<'_>) -> rusqlite::Result<CrossAccountTransfer> {
    let paths_raw: String = row.get("source_paths")?;
    let operation: i64 = row.get("operation")?;
    let status: i64 = row.get("status")?;
    let can_retry: i64 = row.get("can_retry")?;
    Ok(CrossAccountTransfer {
        id: row.get("id")?,
        timestamp: row.get("timestamp")?,
        source_account_id: row.get("source_account_id")?,
        source_paths: paths_raw.split('\u{1f}').map(str::to_string).collect(),
        target_account_id: row.get("target_account_id")?,
        target_path: row.get("target_path")?,
        operation: TransferOperation::from_i64(operation),
        status: TransferStatus::from_i64(status),
        bytes_transferred: row.get::<_, i64>("bytes_transferred")? as u64,
        bytes_total: row.get::<_, i64>("bytes_total")? as u64,
        files_transferred: row.get::<_, i64>("files_transferred")? as u32,
        files_total: row.get::<_, i64>("files_total")? as u32,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        error_message: row.get("error_message")?,
        error_code: row.get("error_code")?,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        can_retry: can_retry != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> CrossAccountTransfer {
        CrossAccountTransfer {
            id: id.to_string(),
            timestamp: 1_700_000_000,
            source_account_id: "acc-source1".to_string(),
            source_paths: vec!["/docs/a.txt".to_string()],
            target_account_id: "acc-target1".to_string(),
            target_path: "/inbox".to_string(),
            operation: TransferOperation::Copy,
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            bytes_total: 42,
            files_transferred: 0,
            files_total: 1,
            start_time: None,
            end_time: None,
            error_message: String::new(),
            error_code: None,
            retry_count: 0,
            can_retry: true,
        }
    }

    #[tokio::test]
    async fn log_then_get_round_trips() {
        let store = TransferLogStore::open_in_memory().unwrap();
        let t = sample("xfr-00000001");
        store.log(t.clone()).await.unwrap();
        let fetched = store.get(&t.id).await.unwrap().unwrap();
        assert_eq!(fetched, t);
    }

    #[tokio::test]
    async fn update_replaces_existing_row() {
        let store = TransferLogStore::open_in_memory().unwrap();
        let mut t = sample("xfr-00000002");
        store.log(t.clone()).await.unwrap();

        t.status = TransferStatus::Completed;
        t.files_transferred = 1;
        store.update(t.clone()).await.unwrap();

        let fetched = store.get(&t.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TransferStatus::Completed);
        assert_eq!(fetched.files_transferred, 1);
    }

    #[tokio::test]
    async fn status_counts_aggregate_correctly() {
        let store = TransferLogStore::open_in_memory().unwrap();
        store.log(sample("xfr-0000000a")).await.unwrap();
        let mut b = sample("xfr-0000000b");
        b.status = TransferStatus::Completed;
        store.log(b).await.unwrap();

        let counts = store.status_counts().await.unwrap();
        let completed = counts
            .iter()
            .find(|(s, _)| *s == TransferStatus::Completed)
            .map(|(_, c)| *c);
        assert_eq!(completed, Some(1));
    }

    #[tokio::test]
    async fn search_matches_substring_in_paths() {
        let store = TransferLogStore::open_in_memory().unwrap();
        store.log(sample("xfr-0000000c")).await.unwrap();
        let hits = store.search("docs", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.search("nonexistent", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_row_and_emits_event() {
        let store = TransferLogStore::open_in_memory().unwrap();
        let mut events = store.subscribe();
        let t = sample("xfr-0000000d");
        store.log(t.clone()).await.unwrap();
        store.delete(&t.id).await.unwrap();
        assert!(store.get(&t.id).await.unwrap().is_none());

        matches!(events.recv().await.unwrap(), TransferLogEvent::Logged(_));
        matches!(events.recv().await.unwrap(), TransferLogEvent::Deleted(_));
    }

    #[tokio::test]
    async fn clear_completed_only_removes_completed_rows() {
        let store = TransferLogStore::open_in_memory().unwrap();
        let mut done = sample("xfr-0000000e");
        done.status = TransferStatus::Completed;
        store.log(done).await.unwrap();
        store.log(sample("xfr-0000000f")).await.unwrap();

        let removed = store.clear_completed().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get_all(10, 0).await.unwrap().len(), 1);
    }
}
