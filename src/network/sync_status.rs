use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

/// Running counters for structured-operation sync in this process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Every attempt to push a queued operation, successful or not.
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Start of the last drain pass that found the remote reachable, in
    /// milliseconds since UNIX_EPOCH.
    pub last_sync_attempt: Option<u64>,
    /// Time of the last confirmed operation, in milliseconds since UNIX_EPOCH.
    pub last_successful_sync: Option<u64>,
}

pub type SharedSyncStats = Arc<Mutex<SyncStats>>;

/// Counts for the upload queue plus the size of the operation log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub uploading: usize,
    pub error: usize,
    pub pending_operations: usize,
}
