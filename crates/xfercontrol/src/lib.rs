#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `xfercontrol` implements component C8 of the VaultSync specification: a
//! single-account controller that adapts one provider's upload/download
//! primitives into tracked, cancellable transfers with aggregated
//! up/down speed reporting.
//!
//! # Design
//!
//! Unlike the cross-account engine (`xfer`), this component has no
//! pipeline to drive — a single provider call (`start_upload`/
//! `start_download`) begins the transfer and returns a handle; whatever
//! bridges the provider's native progress callbacks into this process
//! (out of scope here, same as the specification's "platform provides a
//! mechanism" note in §5) calls [`TransferController::report_progress`]
//! as bytes move. The controller's job is bookkeeping: one
//! [`ActiveTransfer`] per id in a [`dashmap::DashMap`], a rolling
//! bytes/sec estimate per transfer, and a global aggregator summed across
//! every entry on each tick.
//!
//! # Invariants
//!
//! - A completed or failed transfer is removed from the map immediately,
//!   per §4.7 ("to prevent unbounded growth").
//! - [`TransferController::cancel_all`] cancels every active upload and
//!   download in one call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sdk::{Node, ProviderClient, ProviderError, TransferHandle};
use tokio::sync::{broadcast, Mutex};

/// Which direction a tracked transfer moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local file to provider.
    Upload,
    /// Provider node to local file.
    Download,
}

/// A transfer currently tracked by the controller.
#[derive(Debug, Clone)]
pub struct ActiveTransfer {
    /// Opaque id, distinct from the provider's own [`TransferHandle`].
    pub id: String,
    /// Upload or download.
    pub direction: Direction,
    /// Local filesystem path.
    pub local_path: String,
    /// Remote path (destination for uploads, source for downloads).
    pub remote_path: String,
    /// Total size in bytes, if known up front.
    pub size: u64,
    /// Bytes moved so far.
    pub bytes_transferred: u64,
    /// Most recent estimated throughput, bytes/sec.
    pub speed_bps: u64,
    handle: TransferHandle,
    started_at: Instant,
    last_update: Instant,
    last_bytes: u64,
}

/// Events emitted by the controller, per §6 of the specification.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// A transfer began.
    Started {
        /// Tracked id.
        id: String,
        /// Local path.
        local_path: String,
    },
    /// Progress on a tracked transfer.
    Progress {
        /// Tracked id.
        id: String,
        /// Bytes moved so far.
        bytes_transferred: u64,
        /// Total bytes, if known.
        bytes_total: u64,
        /// Estimated throughput, bytes/sec.
        speed_bps: u64,
        /// Estimated seconds remaining, if `speed_bps > 0` and total is known.
        eta_seconds: Option<u64>,
    },
    /// A transfer finished successfully.
    Completed {
        /// Tracked id.
        id: String,
        /// Local path.
        local_path: String,
    },
    /// A transfer failed.
    Failed {
        /// Local path.
        local_path: String,
        /// Human-readable cause.
        error: String,
    },
    /// Queue-wide counts changed.
    QueueStatusChanged {
        /// Transfers currently in flight.
        active: usize,
        /// Reserved for parity with the specification's event shape;
        /// this controller has no separate pending queue.
        pending: usize,
        /// Lifetime completed count.
        completed: u64,
        /// Lifetime failed count.
        failed: u64,
    },
    /// Aggregated throughput across every active transfer.
    GlobalSpeedUpdate {
        /// Summed upload bytes/sec.
        up_bps: u64,
        /// Summed download bytes/sec.
        down_bps: u64,
    },
}

/// Errors produced by the transfer controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// No tracked transfer with this id.
    #[error("no active transfer with id {0}")]
    NotFound(String),

    /// The provider rejected the request.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Generates a fresh transfer id, distinct from the cross-account
/// engine's `"xfr-"` ids to avoid confusing the two subsystems in logs.
fn new_transfer_id() -> String {
    format!("loc-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Tracks uploads and downloads for a single account.
pub struct TransferController {
    client: Arc<dyn ProviderClient>,
    transfers: DashMap<String, Mutex<ActiveTransfer>>,
    events: broadcast::Sender<ControllerEvent>,
    completed_count: std::sync::atomic::AtomicU64,
    failed_count: std::sync::atomic::AtomicU64,
}

impl TransferController {
    /// Creates a controller bound to a single account's client.
    #[must_use]
    pub fn new(client: Arc<dyn ProviderClient>) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(512);
        Arc::new(Self {
            client,
            transfers: DashMap::new(),
            events,
            completed_count: std::sync::atomic::AtomicU64::new(0),
            failed_count: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Subscribes to controller events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    /// Starts uploading `local_path` into `parent`, tracking it under a
    /// fresh id.
    pub async fn start_upload(
        &self,
        local_path: &str,
        parent: &Node,
        size: u64,
    ) -> Result<String, ControllerError> {
        let handle = self.client.start_upload(local_path, parent).await?;
        let id = new_transfer_id();
        let now = Instant::now();
        self.transfers.insert(
            id.clone(),
            Mutex::new(ActiveTransfer {
                id: id.clone(),
                direction: Direction::Upload,
                local_path: local_path.to_string(),
                remote_path: parent.path.clone(),
                size,
                bytes_transferred: 0,
                speed_bps: 0,
                handle,
                started_at: now,
                last_update: now,
                last_bytes: 0,
            }),
        );
        tracing::info!(transfer_id = %id, local_path, size, "upload started");
        self.emit(ControllerEvent::Started {
            id: id.clone(),
            local_path: local_path.to_string(),
        });
        self.emit_queue_status();
        Ok(id)
    }

    /// Starts downloading `node` to `local_path`, tracking it under a
    /// fresh id.
    pub async fn start_download(
        &self,
        node: &Node,
        local_path: &str,
    ) -> Result<String, ControllerError> {
        let handle = self.client.start_download(node, local_path).await?;
        let id = new_transfer_id();
        let now = Instant::now();
        self.transfers.insert(
            id.clone(),
            Mutex::new(ActiveTransfer {
                id: id.clone(),
                direction: Direction::Download,
                local_path: local_path.to_string(),
                remote_path: node.path.clone(),
                size: node.size,
                bytes_transferred: 0,
                speed_bps: 0,
                handle,
                started_at: now,
                last_update: now,
                last_bytes: 0,
            }),
        );
        tracing::info!(transfer_id = %id, local_path, remote_path = %node.path, "download started");
        self.emit(ControllerEvent::Started {
            id: id.clone(),
            local_path: local_path.to_string(),
        });
        self.emit_queue_status();
        Ok(id)
    }

    /// Records a progress tick for `id`, recomputes its instantaneous
    /// throughput, and republishes the aggregated global speed.
    pub async fn report_progress(
        &self,
        id: &str,
        bytes_transferred: u64,
        bytes_total: u64,
    ) -> Result<(), ControllerError> {
        let entry = self
            .transfers
            .get(id)
            .ok_or_else(|| ControllerError::NotFound(id.to_string()))?;
        let (speed_bps, eta_seconds) = {
            let mut t = entry.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(t.last_update);
            let delta = bytes_transferred.saturating_sub(t.last_bytes);
            if elapsed >= Duration::from_millis(200) && delta > 0 {
                t.speed_bps = (delta as f64 / elapsed.as_secs_f64()) as u64;
                t.last_update = now;
                t.last_bytes = bytes_transferred;
            }
            t.bytes_transferred = bytes_transferred;
            t.size = bytes_total.max(t.size);
            let eta = if t.speed_bps > 0 && bytes_total > bytes_transferred {
                Some((bytes_total - bytes_transferred) / t.speed_bps)
            } else {
                None
            };
            (t.speed_bps, eta)
        };
        drop(entry);

        self.emit(ControllerEvent::Progress {
            id: id.to_string(),
            bytes_transferred,
            bytes_total,
            speed_bps,
            eta_seconds,
        });
        self.emit_global_speed().await;
        Ok(())
    }

    /// Marks `id` as completed, removing it from the tracked map.
    pub async fn complete(&self, id: &str) -> Result<(), ControllerError> {
        let (_, entry) = self
            .transfers
            .remove(id)
            .ok_or_else(|| ControllerError::NotFound(id.to_string()))?;
        let local_path = entry.into_inner().local_path;
        self.completed_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(transfer_id = id, local_path, "transfer completed");
        self.emit(ControllerEvent::Completed {
            id: id.to_string(),
            local_path,
        });
        self.emit_queue_status();
        self.emit_global_speed().await;
        Ok(())
    }

    /// Marks `id` as failed with `error`, removing it from the tracked map.
    pub async fn fail(&self, id: &str, error: &str) -> Result<(), ControllerError> {
        let (_, entry) = self
            .transfers
            .remove(id)
            .ok_or_else(|| ControllerError::NotFound(id.to_string()))?;
        let local_path = entry.into_inner().local_path;
        self.failed_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::warn!(transfer_id = id, local_path, error, "transfer failed");
        self.emit(ControllerEvent::Failed {
            local_path,
            error: error.to_string(),
        });
        self.emit_queue_status();
        self.emit_global_speed().await;
        Ok(())
    }

    /// Cancels every currently tracked upload and download in one call.
    pub async fn cancel_all(&self) {
        let handles: Vec<TransferHandle> = {
            let mut out = Vec::new();
            for entry in self.transfers.iter() {
                out.push(entry.value().lock().await.handle.clone());
            }
            out
        };
        tracing::debug!(count = handles.len(), "cancelling all tracked transfers");
        for handle in handles {
            let _ = self.client.cancel_transfer(&handle).await;
        }
    }

    /// Number of transfers currently tracked.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.transfers.len()
    }

    fn emit_queue_status(&self) {
        self.emit(ControllerEvent::QueueStatusChanged {
            active: self.transfers.len(),
            pending: 0,
            completed: self.completed_count.load(std::sync::atomic::Ordering::Relaxed),
            failed: self.failed_count.load(std::sync::atomic::Ordering::Relaxed),
        });
    }

    async fn emit_global_speed(&self) {
        let mut up_bps: u64 = 0;
        let mut down_bps: u64 = 0;
        for entry in self.transfers.iter() {
            let t = entry.value().lock().await;
            match t.direction {
                Direction::Upload => up_bps += t.speed_bps,
                Direction::Download => down_bps += t.speed_bps,
            }
        }
        self.emit(ControllerEvent::GlobalSpeedUpdate { up_bps, down_bps });
    }
}

/// Summarizes tracked transfers by direction, for diagnostics/tests.
#[must_use]
pub fn count_by_direction(transfers: &[ActiveTransfer]) -> HashMap<&'static str, usize> {
    let mut counts = HashMap::new();
    for t in transfers {
        let key = match t.direction {
            Direction::Upload => "upload",
            Direction::Download => "download",
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::{MockProviderClient, PublicLinkRegistry};
    use std::time::Duration as StdDuration;

    fn client() -> Arc<dyn ProviderClient> {
        Arc::new(MockProviderClient::new("acc-1", PublicLinkRegistry::new()))
    }

    fn folder() -> Node {
        Node {
            id: sdk::NodeId(1),
            path: "/".to_string(),
            is_folder: true,
            size: 0,
            is_exported: false,
        }
    }

    #[tokio::test]
    async fn start_upload_tracks_and_emits_started() {
        let controller = TransferController::new(client());
        let mut rx = controller.subscribe();
        let id = controller
            .start_upload("/tmp/file.bin", &folder(), 1024)
            .await
            .unwrap();
        assert_eq!(controller.active_count(), 1);
        match rx.recv().await.unwrap() {
            ControllerEvent::Started { id: got, .. } => assert_eq!(got, id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn report_progress_computes_speed_after_settling_window() {
        let controller = TransferController::new(client());
        let id = controller
            .start_upload("/tmp/file.bin", &folder(), 1000)
            .await
            .unwrap();
        controller.report_progress(&id, 0, 1000).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(250)).await;

        let mut rx = controller.subscribe();
        controller.report_progress(&id, 500, 1000).await.unwrap();
        match rx.recv().await.unwrap() {
            ControllerEvent::Progress { speed_bps, eta_seconds, .. } => {
                assert!(speed_bps > 0);
                assert!(eta_seconds.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_removes_from_map_and_bumps_counter() {
        let controller = TransferController::new(client());
        let id = controller
            .start_upload("/tmp/file.bin", &folder(), 10)
            .await
            .unwrap();
        controller.complete(&id).await.unwrap();
        assert_eq!(controller.active_count(), 0);
        assert!(controller.report_progress(&id, 1, 10).await.is_err());
    }

    #[tokio::test]
    async fn fail_removes_from_map_and_emits_failed() {
        let controller = TransferController::new(client());
        let mut rx = controller.subscribe();
        let id = controller
            .start_upload("/tmp/file.bin", &folder(), 10)
            .await
            .unwrap();
        let _ = rx.recv().await; // Started
        controller.fail(&id, "disk full").await.unwrap();
        match rx.recv().await.unwrap() {
            ControllerEvent::Failed { error, .. } => assert_eq!(error, "disk full"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_all_calls_provider_for_every_transfer() {
        let controller = TransferController::new(client());
        controller
            .start_upload("/tmp/a.bin", &folder(), 10)
            .await
            .unwrap();
        controller
            .start_upload("/tmp/b.bin", &folder(), 10)
            .await
            .unwrap();
        controller.cancel_all().await;
    }

    #[tokio::test]
    async fn global_speed_sums_across_active_transfers() {
        let controller = TransferController::new(client());
        let u1 = controller
            .start_upload("/tmp/a.bin", &folder(), 1000)
            .await
            .unwrap();
        let u2 = controller
            .start_upload("/tmp/b.bin", &folder(), 1000)
            .await
            .unwrap();
        controller.report_progress(&u1, 0, 1000).await.unwrap();
        controller.report_progress(&u2, 0, 1000).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(250)).await;

        let mut rx = controller.subscribe();
        controller.report_progress(&u1, 500, 1000).await.unwrap();
        controller.report_progress(&u2, 500, 1000).await.unwrap();

        let mut saw_global = false;
        for _ in 0..6 {
            if let Ok(ControllerEvent::GlobalSpeedUpdate { up_bps, .. }) = rx.recv().await {
                if up_bps > 0 {
                    saw_global = true;
                    break;
                }
            }
        }
        assert!(saw_global);
    }
}
