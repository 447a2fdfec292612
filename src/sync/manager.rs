use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;

use super::backoff::Backoff;
use super::operation_queue::OperationQueue;
use crate::common::{now_ms, TaskHandle};
use crate::config::SyncConfig;
use crate::network::{
    with_timeout, ListenerId, NetworkMonitor, RemoteError, RemoteSyncClient, SharedSyncStats,
    SyncStats,
};
use crate::storage::{record_id, OperationType, PendingOperation, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Draining,
    Backoff,
}

/// Why a drain pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    QueueEmpty,
    /// Too many consecutive failures; the rest waits for the next trigger.
    CircuitOpen,
    Offline,
    StorageFault,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub stop: StopReason,
}

impl DrainReport {
    fn stopped(stop: StopReason) -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            dead_lettered: 0,
            stop,
        }
    }
}

enum FailureOutcome {
    Retry,
    DeadLettered,
}

/// Push one mutation to the remote. Non-delete writes are read back with
/// `verify_sync` and count as failed when the remote does not show them.
pub async fn push_operation(
    remote: &dyn RemoteSyncClient,
    op_type: OperationType,
    table: &str,
    data: &Value,
    limit: Duration,
) -> Result<(), RemoteError> {
    let id = record_id(data)
        .ok_or_else(|| RemoteError::InvalidRequest(format!("{op_type} on '{table}' without id")))?;

    match op_type {
        OperationType::Create => with_timeout(limit, remote.create_remote(table, data)).await?,
        OperationType::Update => with_timeout(limit, remote.update_remote(table, data)).await?,
        OperationType::Upsert => with_timeout(limit, remote.upsert_remote(table, data)).await?,
        OperationType::Delete => {
            return with_timeout(limit, remote.delete_remote(table, &id)).await;
        }
    }

    if with_timeout(limit, remote.verify_sync(table, &id)).await? {
        Ok(())
    } else {
        Err(RemoteError::NotVerified {
            table: table.to_string(),
            id,
        })
    }
}

/// Drains the operation queue against the remote whenever the network
/// monitor reports an active connection.
///
/// Passes are single-flight. A pass stops when the queue is empty, the
/// remote becomes unreachable, the local store fails, or
/// `max_consecutive_failures` attempts in a row have failed.
pub struct SyncManager {
    queue: Arc<OperationQueue>,
    remote: Arc<dyn RemoteSyncClient>,
    monitor: Arc<NetworkMonitor>,
    stats: SharedSyncStats,
    backoff: Backoff,
    interval: Duration,
    request_timeout: Duration,
    max_consecutive_failures: u32,
    consecutive_failures: AtomicU32,
    draining: AtomicBool,
    state: Mutex<SyncState>,
    timer: Mutex<Option<TaskHandle>>,
}

impl SyncManager {
    pub fn new(
        queue: Arc<OperationQueue>,
        remote: Arc<dyn RemoteSyncClient>,
        monitor: Arc<NetworkMonitor>,
        stats: SharedSyncStats,
        config: &SyncConfig,
    ) -> Self {
        Self {
            queue,
            remote,
            monitor,
            stats,
            backoff: Backoff::from_config(config),
            interval: config.interval(),
            request_timeout: config.request_timeout(),
            max_consecutive_failures: config.max_consecutive_failures,
            consecutive_failures: AtomicU32::new(0),
            draining: AtomicBool::new(false),
            state: Mutex::new(SyncState::Idle),
            timer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> SyncStats {
        self.stats.lock().await.clone()
    }

    /// Subscribe to the monitor's online/offline edges.
    pub fn attach(self: &Arc<Self>) -> (ListenerId, ListenerId) {
        let weak = Arc::downgrade(self);
        let online = self.monitor.add_online_listener(move || {
            if let Some(manager) = weak.upgrade() {
                manager.handle_online();
            }
        });

        let weak = Arc::downgrade(self);
        let offline = self.monitor.add_offline_listener(move || {
            if let Some(manager) = weak.upgrade() {
                manager.handle_offline();
            }
        });

        (online, offline)
    }

    pub fn detach(&self, listeners: (ListenerId, ListenerId)) {
        self.monitor.remove_online_listener(listeners.0);
        self.monitor.remove_offline_listener(listeners.1);
        self.stop_timer();
    }

    /// Online edge: clear the breaker, restart the timer and drain now.
    pub fn handle_online(self: &Arc<Self>) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.start_timer();

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.drain().await;
        });
    }

    /// Offline edge: stop scheduling passes. A pass already running keeps
    /// going until its own connectivity check fails.
    pub fn handle_offline(&self) {
        self.stop_timer();
        log::info!("Sync timer stopped while offline");
    }

    pub fn start_timer(self: &Arc<Self>) {
        let mut timer = self.timer.lock().unwrap_or_else(|p| p.into_inner());
        if timer.as_ref().map_or(false, TaskHandle::is_running) {
            return;
        }

        let weak = Arc::downgrade(self);
        let interval = self.interval;
        *timer = Some(TaskHandle::spawn("sync-timer", async move {
            loop {
                sleep(interval).await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                // Each pass runs in its own task so stopping the timer never
                // cancels a pass midway.
                tokio::spawn(async move {
                    manager.drain().await;
                });
            }
        }));
    }

    pub fn stop_timer(&self) {
        if let Some(mut handle) = self.timer.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.stop();
        }
    }

    pub fn timer_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map_or(false, TaskHandle::is_running)
    }

    /// Run one drain pass. Returns immediately with
    /// [`StopReason::AlreadyRunning`] if another pass is in progress.
    pub async fn drain(&self) -> DrainReport {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Sync pass already running; trigger ignored");
            return DrainReport::stopped(StopReason::AlreadyRunning);
        }
        let _guard = DrainGuard { manager: self };

        let report = self.run_pass().await;
        if report.succeeded > 0 || report.failed > 0 {
            log::info!(
                "Sync pass finished: {} synced, {} failed, {} dropped ({:?})",
                report.succeeded,
                report.failed,
                report.dead_lettered,
                report.stop
            );
        }
        report
    }

    async fn run_pass(&self) -> DrainReport {
        let mut report = DrainReport::stopped(StopReason::QueueEmpty);
        self.consecutive_failures.store(0, Ordering::SeqCst);

        if !self.monitor.has_active_connection().await {
            log::debug!("Skipping sync pass: remote not reachable");
            report.stop = StopReason::Offline;
            return report;
        }

        self.set_state(SyncState::Draining);
        self.stats.lock().await.last_sync_attempt = Some(now_ms());

        loop {
            let failures = self.consecutive_failures.load(Ordering::SeqCst);
            if failures >= self.max_consecutive_failures {
                log::warn!(
                    "Sync pass stopped after {} consecutive failures; remaining operations wait for the next trigger",
                    failures
                );
                report.stop = StopReason::CircuitOpen;
                break;
            }

            if !self.monitor.has_active_connection().await {
                report.stop = StopReason::Offline;
                break;
            }

            let op = match self.queue.dequeue().await {
                Ok(Some(op)) => op,
                Ok(None) => {
                    report.stop = StopReason::QueueEmpty;
                    break;
                }
                Err(e) => {
                    log::error!("Sync pass aborted, cannot read operation log: {e}");
                    report.stop = StopReason::StorageFault;
                    break;
                }
            };

            self.stats.lock().await.total_operations += 1;

            let pushed = push_operation(
                self.remote.as_ref(),
                op.op_type,
                &op.table,
                &op.data,
                self.request_timeout,
            )
            .await;

            match pushed {
                Ok(()) => {
                    report.succeeded += 1;
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    {
                        let mut stats = self.stats.lock().await;
                        stats.successful_operations += 1;
                        stats.last_successful_sync = Some(now_ms());
                    }

                    if let Err(e) = self.queue.remove(op.id).await {
                        log::error!("Operation {} synced but could not be removed: {e}", op.id);
                        report.stop = StopReason::StorageFault;
                        break;
                    }
                    log::debug!("Synced {} on '{}' (operation {})", op.op_type, op.table, op.id);
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    report.failed += 1;
                    self.stats.lock().await.failed_operations += 1;

                    log::warn!(
                        "Sync of operation {} ({} on '{}') failed on attempt {} ({} consecutive): {e}",
                        op.id,
                        op.op_type,
                        op.table,
                        op.retry_count + 1,
                        failures
                    );

                    match self.record_failure(&op).await {
                        Ok(FailureOutcome::Retry) => {
                            if failures < self.max_consecutive_failures {
                                let delay = self.backoff.delay(failures);
                                log::debug!("Backing off {:?} before the next attempt", delay);
                                self.set_state(SyncState::Backoff);
                                sleep(delay).await;
                                self.set_state(SyncState::Draining);
                            }
                        }
                        Ok(FailureOutcome::DeadLettered) => report.dead_lettered += 1,
                        Err(e) => {
                            log::error!("Sync pass aborted, cannot record failure of {}: {e}", op.id);
                            report.stop = StopReason::StorageFault;
                            break;
                        }
                    }
                }
            }
        }

        report
    }

    /// Count a failed attempt against the operation and drop it once its
    /// retry budget is used up.
    async fn record_failure(&self, op: &PendingOperation) -> Result<FailureOutcome, StorageError> {
        let op = if self.queue.should_retry(op) {
            self.queue.update_retry_count(op).await?
        } else {
            op.clone()
        };

        if self.queue.should_retry(&op) {
            return Ok(FailureOutcome::Retry);
        }

        self.queue.remove(op.id).await?;
        log::warn!(
            "Dropping operation {} ({} on '{}') after {} failed attempts",
            op.id,
            op.op_type,
            op.table,
            op.retry_count
        );
        Ok(FailureOutcome::DeadLettered)
    }
}

struct DrainGuard<'a> {
    manager: &'a SyncManager,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.manager.set_state(SyncState::Idle);
        self.manager.draining.store(false, Ordering::Release);
    }
}
