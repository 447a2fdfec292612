mod error;
mod sled_store;
mod table;
mod types;

use async_trait::async_trait;

pub use self::error::StorageError;
pub use self::sled_store::SledStore;
pub use self::table::Table;
pub use self::types::{
    record_id, OperationType, PendingOperation, ProcessingQueueItem, UploadKind, UploadStatus,
    VersionedRecord,
};

/// Durable local storage for the sync engine.
///
/// Every method is atomic for the single item it touches. Failures are
/// reported as [`StorageError`] and treated by callers as local faults.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fresh unique id, monotonic across restarts.
    async fn next_id(&self) -> Result<u64, StorageError>;

    async fn add_pending_operation(&self, op: &PendingOperation) -> Result<(), StorageError>;
    /// Oldest first. Enqueue order wins over the recorded timestamps.
    async fn pending_operations_by_timestamp(&self) -> Result<Vec<PendingOperation>, StorageError>;
    async fn oldest_pending_operation(&self) -> Result<Option<PendingOperation>, StorageError>;
    async fn update_pending_operation(&self, op: &PendingOperation) -> Result<(), StorageError>;
    async fn delete_pending_operation(&self, id: u64) -> Result<(), StorageError>;
    /// Operations whose retry count has reached `max_retries`.
    async fn failed_operations(&self, max_retries: u32)
        -> Result<Vec<PendingOperation>, StorageError>;
    async fn count_pending_operations(&self) -> Result<usize, StorageError>;

    async fn add_upload_item(&self, item: &ProcessingQueueItem) -> Result<(), StorageError>;
    async fn get_upload_item(&self, id: u64) -> Result<Option<ProcessingQueueItem>, StorageError>;
    async fn update_upload_item(&self, item: &ProcessingQueueItem) -> Result<(), StorageError>;
    async fn delete_upload_item(&self, id: u64) -> Result<(), StorageError>;
    /// Items with the given status, oldest first.
    async fn upload_items_by_status(
        &self,
        status: UploadStatus,
    ) -> Result<Vec<ProcessingQueueItem>, StorageError>;
    async fn count_upload_items_by_status(&self, status: UploadStatus)
        -> Result<usize, StorageError>;

    async fn get_record(&self, table: &str, id: &str)
        -> Result<Option<VersionedRecord>, StorageError>;
    async fn put_record(&self, record: &VersionedRecord) -> Result<(), StorageError>;
    async fn delete_record(&self, table: &str, id: &str) -> Result<(), StorageError>;

    async fn flush(&self) -> Result<(), StorageError>;
}
