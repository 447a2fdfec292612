use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;

use super::backoff::Backoff;
use crate::common::Clock;
use crate::config::Config;
use crate::network::{with_timeout, NetworkMonitor, QueueStats, RemoteFileStore};
use crate::storage::{ProcessingQueueItem, Storage, StorageError, UploadKind, UploadStatus};

pub const OFFLINE_MESSAGE: &str = "Uploads pending due to offline status";
pub const CANCELLED_MESSAGE: &str = "Upload cancelled by user";

/// A binary payload handed to the upload queue.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub kind: UploadKind,
    pub sample_id: String,
    pub config_id: String,
    pub file_path: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgress {
    /// Share of the items taken at pass start that have completed, 0 to 100.
    pub percent: f64,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub total: usize,
    pub uploaded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    AlreadyRunning,
    Offline,
    Finished(UploadReport),
    Cancelled(UploadReport),
    StorageFault(UploadReport),
}

struct PassState {
    running: bool,
    generation: u64,
}

#[derive(Clone)]
struct Uploader {
    storage: Arc<dyn Storage>,
    files: Arc<dyn RemoteFileStore>,
    backoff: Backoff,
    max_retries: u32,
    request_timeout: Duration,
    /// Transfer permits, shared across passes.
    slots: Arc<Semaphore>,
}

/// Bounded-concurrency pipeline for queued binary payloads.
///
/// Items are uploaded in chunks of `max_concurrent_uploads`; a chunk is
/// finished before the next one starts. Items that exhaust their retries
/// stay in the queue with `Error` status. Items found in `Uploading` are
/// only reset by [`UploadManager::recover_interrupted`], which the engine
/// runs once at startup.
pub struct UploadManager {
    uploader: Uploader,
    monitor: Arc<NetworkMonitor>,
    clock: Clock,
    chunk_size: usize,
    pass: Mutex<PassState>,
}

impl UploadManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        files: Arc<dyn RemoteFileStore>,
        monitor: Arc<NetworkMonitor>,
        config: &Config,
    ) -> Self {
        let chunk_size = config.upload.max_concurrent_uploads.max(1);
        Self {
            uploader: Uploader {
                storage,
                files,
                backoff: Backoff::from_config(&config.sync),
                max_retries: config.upload.max_retries.max(1),
                request_timeout: config.sync.request_timeout(),
                slots: Arc::new(Semaphore::new(chunk_size)),
            },
            monitor,
            clock: Clock::new(),
            chunk_size,
            pass: Mutex::new(PassState {
                running: false,
                generation: 0,
            }),
        }
    }

    fn storage(&self) -> &dyn Storage {
        self.uploader.storage.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.lock_pass().running
    }

    fn lock_pass(&self) -> std::sync::MutexGuard<'_, PassState> {
        self.pass.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn try_begin(&self) -> Option<u64> {
        let mut pass = self.lock_pass();
        if pass.running {
            return None;
        }
        pass.running = true;
        Some(pass.generation)
    }

    fn is_cancelled(&self, generation: u64) -> bool {
        self.lock_pass().generation != generation
    }

    pub async fn queue_upload(&self, upload: NewUpload) -> Result<ProcessingQueueItem, StorageError> {
        let item = ProcessingQueueItem {
            id: self.storage().next_id().await?,
            kind: upload.kind,
            sample_id: upload.sample_id,
            config_id: upload.config_id,
            file_path: upload.file_path,
            payload: upload.payload,
            timestamp: self.clock.now(),
            retry_count: 0,
            status: UploadStatus::Pending,
            error: None,
        };
        self.storage().add_upload_item(&item).await?;

        log::info!(
            "Queued {} upload {} for sample {} ({} bytes)",
            item.kind,
            item.file_path,
            item.sample_id,
            item.payload.len()
        );
        Ok(item)
    }

    /// Upload every pending item, reporting progress after each one.
    ///
    /// Returns at once when a pass is already running, or when the remote
    /// is unreachable; in that case `on_progress` receives
    /// [`OFFLINE_MESSAGE`] and storage is not touched.
    pub async fn start_upload_process<F>(&self, on_progress: F) -> UploadOutcome
    where
        F: Fn(UploadProgress) + Send + Sync,
    {
        let Some(generation) = self.try_begin() else {
            log::debug!("Upload pass already running");
            return UploadOutcome::AlreadyRunning;
        };
        let _guard = PassGuard {
            manager: self,
            generation,
        };

        if !self.monitor.has_active_connection().await {
            on_progress(UploadProgress {
                percent: 0.0,
                status: OFFLINE_MESSAGE.to_string(),
            });
            return UploadOutcome::Offline;
        }

        let mut report = UploadReport::default();
        let items = match self.storage().upload_items_by_status(UploadStatus::Pending).await {
            Ok(items) => items,
            Err(e) => {
                log::error!("Upload pass aborted, cannot read upload queue: {e}");
                return UploadOutcome::StorageFault(report);
            }
        };

        report.total = items.len();
        if items.is_empty() {
            return UploadOutcome::Finished(report);
        }
        log::info!(
            "Starting upload pass: {} items, {} at a time",
            report.total,
            self.chunk_size
        );

        let mut processed = 0usize;
        for chunk in items.chunks(self.chunk_size) {
            if self.is_cancelled(generation) {
                log::info!("Upload pass cancelled after {processed} of {} items", report.total);
                return UploadOutcome::Cancelled(report);
            }

            let mut tasks = JoinSet::new();
            for item in chunk {
                let uploader = self.uploader.clone();
                let item = item.clone();
                tasks.spawn(async move { uploader.upload(item).await });
            }

            while let Some(joined) = tasks.join_next().await {
                processed += 1;
                let status = match joined {
                    Ok((name, Ok(()))) => {
                        report.uploaded += 1;
                        format!("Uploaded {name} ({processed}/{})", report.total)
                    }
                    Ok((name, Err(message))) => {
                        report.failed += 1;
                        format!("Failed to upload {name} ({processed}/{}): {message}", report.total)
                    }
                    Err(e) => {
                        report.failed += 1;
                        log::error!("Upload task ended abnormally: {e}");
                        format!("Failed to upload ({processed}/{}): {e}", report.total)
                    }
                };
                on_progress(UploadProgress {
                    percent: (processed as f64 * 100.0) / report.total as f64,
                    status,
                });
            }
        }

        log::info!(
            "Upload pass finished: {} uploaded, {} failed",
            report.uploaded,
            report.failed
        );
        UploadOutcome::Finished(report)
    }

    /// Stop scheduling further chunks and flag every pending item as
    /// cancelled. Transfers already in flight run to completion.
    pub async fn cancel_all_uploads(&self) -> Result<usize, StorageError> {
        {
            let mut pass = self.lock_pass();
            pass.running = false;
            pass.generation += 1;
        }

        let pending = self.storage().upload_items_by_status(UploadStatus::Pending).await?;
        for mut item in pending.iter().cloned() {
            item.mark_error(CANCELLED_MESSAGE);
            self.storage().update_upload_item(&item).await?;
        }

        log::info!("Cancelled {} pending uploads", pending.len());
        Ok(pending.len())
    }

    /// Put every errored item back in the pending state. The retry count is
    /// kept as a record of earlier attempts.
    pub async fn retry_failed_uploads(&self) -> Result<usize, StorageError> {
        let failed = self.storage().upload_items_by_status(UploadStatus::Error).await?;
        for mut item in failed.iter().cloned() {
            item.status = UploadStatus::Pending;
            item.error = None;
            self.storage().update_upload_item(&item).await?;
        }
        if !failed.is_empty() {
            log::info!("Re-queued {} failed uploads", failed.len());
        }
        Ok(failed.len())
    }

    /// Items left in `Uploading` by a process that stopped mid-pass. Only
    /// safe while no pass is running.
    pub async fn recover_interrupted(&self) -> Result<usize, StorageError> {
        let stale = self.storage().upload_items_by_status(UploadStatus::Uploading).await?;
        for mut item in stale.iter().cloned() {
            item.status = UploadStatus::Pending;
            self.storage().update_upload_item(&item).await?;
        }
        if !stale.is_empty() {
            log::warn!("Recovered {} interrupted uploads", stale.len());
        }
        Ok(stale.len())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, StorageError> {
        let storage = self.storage();
        Ok(QueueStats {
            pending: storage.count_upload_items_by_status(UploadStatus::Pending).await?,
            uploading: storage.count_upload_items_by_status(UploadStatus::Uploading).await?,
            error: storage.count_upload_items_by_status(UploadStatus::Error).await?,
            pending_operations: storage.count_pending_operations().await?,
        })
    }
}

impl Uploader {
    /// Upload one item with retries. Returns the file name for progress
    /// messages along with the final result.
    async fn upload(&self, item: ProcessingQueueItem) -> (String, Result<(), String>) {
        let name = item.file_name().to_string();
        let result = match self.slots.clone().acquire_owned().await {
            Ok(_permit) => self.attempt(item.id).await,
            Err(e) => Err(e.to_string()),
        };
        (name, result)
    }

    async fn attempt(&self, id: u64) -> Result<(), String> {
        // The listing taken at pass start may be stale by now, e.g. after a
        // cancel. Only a still-pending item is claimed.
        let mut item = match self.storage.get_upload_item(id).await {
            Ok(Some(item)) if item.status == UploadStatus::Pending => item,
            Ok(Some(item)) => {
                log::debug!("Skipping upload {id}, now {:?}", item.status);
                return Err(item
                    .error
                    .unwrap_or_else(|| format!("no longer pending ({:?})", item.status)));
            }
            Ok(None) => return Err("removed from the upload queue".to_string()),
            Err(e) => return Err(e.to_string()),
        };

        item.status = UploadStatus::Uploading;
        self.storage
            .update_upload_item(&item)
            .await
            .map_err(|e| e.to_string())?;

        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            let sent = with_timeout(
                self.request_timeout,
                self.files.upload_file(item.kind, &item.file_path, &item.payload),
            )
            .await;

            match sent {
                Ok(()) => {
                    self.storage
                        .delete_upload_item(item.id)
                        .await
                        .map_err(|e| e.to_string())?;
                    log::debug!("Uploaded {} on attempt {attempt}", item.file_path);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Upload of {} failed (attempt {attempt}/{}): {e}",
                        item.file_path,
                        self.max_retries
                    );
                    last_error = e.to_string();
                    if attempt < self.max_retries {
                        sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }

        item.mark_error(last_error.clone());
        if let Err(e) = self.storage.update_upload_item(&item).await {
            log::error!("Cannot record failed upload {}: {e}", item.id);
        }
        Err(last_error)
    }
}

struct PassGuard<'a> {
    manager: &'a UploadManager,
    generation: u64,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let mut pass = self.manager.lock_pass();
        // A cancelled pass must not clear the flag of a newer one.
        if pass.generation == self.generation {
            pass.running = false;
        }
    }
}
