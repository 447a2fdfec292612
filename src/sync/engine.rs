use std::sync::Arc;

use serde_json::Value;

use super::conflict::{settle, ConflictResolver, RecordEdit, SaveOutcome};
use super::manager::{push_operation, DrainReport, SyncManager, SyncState};
use super::operation_queue::{NewOperation, OperationQueue};
use super::upload::{NewUpload, UploadManager, UploadOutcome, UploadProgress};
use crate::common::{now_ms, TaskHandle};
use crate::config::Config;
use crate::error::EngineError;
use crate::network::{
    ConnectivityState, ListenerId, NetworkMonitor, QueueStats, ReachabilityProbe, RemoteFileStore,
    RemoteSyncClient, SharedSyncStats, SyncStats,
};
use crate::storage::{
    record_id, OperationType, PendingOperation, ProcessingQueueItem, Storage, VersionedRecord,
};

/// How a mutation left the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Confirmed by the remote right away.
    Pushed,
    /// Stored in the operation log under this id.
    Queued(u64),
}

/// Application root: owns the monitor, the operation queue, the sync and
/// upload managers, and wires them together.
pub struct SyncEngine {
    config: Config,
    storage: Arc<dyn Storage>,
    remote: Arc<dyn RemoteSyncClient>,
    monitor: Arc<NetworkMonitor>,
    queue: Arc<OperationQueue>,
    sync: Arc<SyncManager>,
    uploads: Arc<UploadManager>,
    resolver: ConflictResolver,
    stats: SharedSyncStats,
}

impl SyncEngine {
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        remote: Arc<dyn RemoteSyncClient>,
        files: Arc<dyn RemoteFileStore>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        let request_timeout = config.sync.request_timeout();
        let monitor = Arc::new(NetworkMonitor::new(probe, &config.network, request_timeout));
        let queue = Arc::new(OperationQueue::new(
            Arc::clone(&storage),
            config.sync.max_retries,
        ));
        let stats = SharedSyncStats::default();

        let sync = Arc::new(SyncManager::new(
            Arc::clone(&queue),
            Arc::clone(&remote),
            Arc::clone(&monitor),
            Arc::clone(&stats),
            &config.sync,
        ));
        let uploads = Arc::new(UploadManager::new(
            Arc::clone(&storage),
            files,
            Arc::clone(&monitor),
            &config,
        ));
        let resolver = ConflictResolver::new(
            Arc::clone(&storage),
            Arc::clone(&remote),
            Arc::clone(&monitor),
            request_timeout,
        );

        Self {
            config,
            storage,
            remote,
            monitor,
            queue,
            sync,
            uploads,
            resolver,
            stats,
        }
    }

    /// Recover interrupted uploads, subscribe to connectivity edges, run the
    /// startup probe and begin periodic probing.
    ///
    /// Periodic work stops when the returned handle is dropped.
    pub async fn start(&self) -> Result<EngineHandle, EngineError> {
        self.uploads.recover_interrupted().await?;

        let sync_listeners = self.sync.attach();
        let upload_listener = self.config.upload.upload_on_reconnect.then(|| {
            let weak = Arc::downgrade(&self.uploads);
            self.monitor.add_online_listener(move || {
                let Some(uploads) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    uploads.start_upload_process(log_progress).await;
                });
            })
        });

        self.monitor.init().await;
        let probe = self.monitor.start();

        let pending = self.queue.len().await?;
        log::info!(
            "Sync engine started ({:?}, {} operations pending)",
            self.monitor.state(),
            pending
        );

        Ok(EngineHandle {
            monitor: Arc::clone(&self.monitor),
            sync: Arc::clone(&self.sync),
            sync_listeners,
            upload_listener,
            _probe: probe,
        })
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Push a mutation straight to the remote when it is reachable and
    /// nothing is queued ahead of it; otherwise append it to the operation
    /// log. A failed direct push falls back to the log.
    pub async fn mutate(
        &self,
        op_type: OperationType,
        table: &str,
        data: Value,
    ) -> Result<Delivery, EngineError> {
        require_id(table, &data)?;

        if self.monitor.state() == ConnectivityState::Online
            && self.queue.is_empty().await?
            && self.monitor.has_active_connection().await
        {
            match push_operation(
                self.remote.as_ref(),
                op_type,
                table,
                &data,
                self.config.sync.request_timeout(),
            )
            .await
            {
                Ok(()) => {
                    log::debug!("Pushed {op_type} on '{table}' directly");
                    return Ok(Delivery::Pushed);
                }
                Err(e) => log::warn!("Direct push of {op_type} on '{table}' failed, queueing: {e}"),
            }
        }

        let op = self.enqueue(NewOperation::new(op_type, table, data)).await?;
        Ok(Delivery::Queued(op.id))
    }

    pub async fn enqueue(&self, op: NewOperation) -> Result<PendingOperation, EngineError> {
        require_id(&op.table, &op.data)?;
        Ok(self.queue.enqueue(op).await?)
    }

    /// Save an edit to a versioned record. A newer visible copy replaces the
    /// local one and the edit is dropped; otherwise the record is stored
    /// with the next version and synced as an upsert.
    pub async fn save_record(&self, edit: RecordEdit) -> Result<SaveOutcome, EngineError> {
        if edit.id.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "record in '{}' without id",
                edit.table
            )));
        }

        let visible = self.resolver.visible_record(&edit.table, &edit.id).await?;
        let outcome = settle(edit, visible, now_ms());

        match &outcome {
            SaveOutcome::Discarded(record) => {
                self.storage.put_record(record).await?;
                log::warn!(
                    "Discarded local edit of {}/{}: version {} is newer",
                    record.table,
                    record.id,
                    record.version
                );
            }
            SaveOutcome::Accepted(record) => {
                self.storage.put_record(record).await?;
                self.mutate(OperationType::Upsert, &record.table, record.to_payload())
                    .await?;
            }
        }
        Ok(outcome)
    }

    pub async fn get_record(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<VersionedRecord>, EngineError> {
        Ok(self.storage.get_record(table, id).await?)
    }

    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>, EngineError> {
        Ok(self.queue.pending().await?)
    }

    pub async fn failed_operations(&self) -> Result<Vec<PendingOperation>, EngineError> {
        Ok(self.queue.failed().await?)
    }

    pub async fn stats(&self) -> SyncStats {
        self.stats.lock().await.clone()
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    /// Whether periodic drain passes are currently scheduled.
    pub fn sync_timer_running(&self) -> bool {
        self.sync.timer_running()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.sync.consecutive_failures()
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, EngineError> {
        Ok(self.uploads.queue_stats().await?)
    }

    /// Run a drain pass now.
    pub async fn sync_now(&self) -> DrainReport {
        self.sync.drain().await
    }

    pub async fn start_upload_process<F>(&self, on_progress: F) -> UploadOutcome
    where
        F: Fn(UploadProgress) + Send + Sync,
    {
        self.uploads.start_upload_process(on_progress).await
    }

    pub async fn cancel_all_uploads(&self) -> Result<usize, EngineError> {
        Ok(self.uploads.cancel_all_uploads().await?)
    }

    pub async fn queue_upload(&self, upload: NewUpload) -> Result<ProcessingQueueItem, EngineError> {
        Ok(self.uploads.queue_upload(upload).await?)
    }

    pub async fn retry_failed_uploads(&self) -> Result<usize, EngineError> {
        Ok(self.uploads.retry_failed_uploads().await?)
    }

    pub fn add_online_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.monitor.add_online_listener(callback)
    }

    pub fn add_offline_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.monitor.add_offline_listener(callback)
    }

    pub fn remove_online_listener(&self, id: ListenerId) -> bool {
        self.monitor.remove_online_listener(id)
    }

    pub fn remove_offline_listener(&self, id: ListenerId) -> bool {
        self.monitor.remove_offline_listener(id)
    }

    pub async fn flush(&self) -> Result<(), EngineError> {
        Ok(self.storage.flush().await?)
    }
}

/// Keeps the engine's periodic tasks and listeners alive.
pub struct EngineHandle {
    monitor: Arc<NetworkMonitor>,
    sync: Arc<SyncManager>,
    sync_listeners: (ListenerId, ListenerId),
    upload_listener: Option<ListenerId>,
    _probe: TaskHandle,
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.sync.detach(self.sync_listeners);
        if let Some(id) = self.upload_listener {
            self.monitor.remove_online_listener(id);
        }
        log::debug!("Sync engine stopped");
    }
}

fn require_id(table: &str, data: &Value) -> Result<(), EngineError> {
    match record_id(data) {
        Some(_) => Ok(()),
        None => Err(EngineError::InvalidInput(format!(
            "payload for '{table}' has no id"
        ))),
    }
}

fn log_progress(progress: UploadProgress) {
    log::info!("[{:>3.0}%] {}", progress.percent, progress.status);
}
