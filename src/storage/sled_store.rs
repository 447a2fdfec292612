use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::error::StorageError;
use super::table::Table;
use super::types::{PendingOperation, ProcessingQueueItem, UploadStatus, VersionedRecord};
use super::Storage;

const PENDING_TREE: &str = "pending_operations";
const UPLOAD_TREE: &str = "upload_queue";
const RECORD_TREE: &str = "records";

fn upload_by_status(item: &ProcessingQueueItem) -> Vec<u8> {
    vec![item.status.index_byte()]
}

/// Sled-backed implementation of [`Storage`].
///
/// Primary keys are big-endian ids from [`sled::Db::generate_id`], which
/// grow in enqueue order across restarts. Pending operations are read in
/// primary-key order; upload items through a status index whose entries
/// end in the id. Queue order never depends on the wall clock.
pub struct SledStore {
    db: sled::Db,
    path: Option<PathBuf>,
    pending: Table<PendingOperation>,
    uploads: Table<ProcessingQueueItem>,
    records: Table<VersionedRecord>,
}

impl SledStore {
    /// Open or create the store in `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let db = sled::open(&path)?;
        let store = Self::from_db(db, Some(path))?;

        log::info!(
            "Local store opened at {:?} ({} pending operations, {} queued uploads)",
            store.path,
            store.pending.len(),
            store.uploads.len()
        );

        Ok(store)
    }

    /// In-memory store that is discarded on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, None)
    }

    fn from_db(db: sled::Db, path: Option<PathBuf>) -> Result<Self, StorageError> {
        let pending = Table::open(&db, PENDING_TREE)?;
        let uploads = Table::open_indexed(&db, UPLOAD_TREE, "status", upload_by_status)?;
        let records = Table::open(&db, RECORD_TREE)?;

        Ok(Self {
            db,
            path,
            pending,
            uploads,
            records,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[async_trait]
impl Storage for SledStore {
    async fn next_id(&self) -> Result<u64, StorageError> {
        // Sled reserves id ranges durably, so ids never repeat across restarts.
        // Offset by one to keep 0 free as a sentinel.
        Ok(self.db.generate_id()? + 1)
    }

    async fn add_pending_operation(&self, op: &PendingOperation) -> Result<(), StorageError> {
        self.pending.put(&op.id.to_be_bytes(), op)?;
        log::debug!(
            "Stored pending {} operation {} for table '{}'",
            op.op_type,
            op.id,
            op.table
        );
        Ok(())
    }

    async fn pending_operations_by_timestamp(&self) -> Result<Vec<PendingOperation>, StorageError> {
        self.pending.scan_index(&[])
    }

    async fn oldest_pending_operation(&self) -> Result<Option<PendingOperation>, StorageError> {
        self.pending.first_in_index(&[])
    }

    async fn update_pending_operation(&self, op: &PendingOperation) -> Result<(), StorageError> {
        let key = op.id.to_be_bytes();
        if self.pending.get(&key)?.is_none() {
            return Err(StorageError::NotFound(format!("pending operation {}", op.id)));
        }
        self.pending.put(&key, op)
    }

    async fn delete_pending_operation(&self, id: u64) -> Result<(), StorageError> {
        self.pending.remove(&id.to_be_bytes())?;
        Ok(())
    }

    async fn failed_operations(
        &self,
        max_retries: u32,
    ) -> Result<Vec<PendingOperation>, StorageError> {
        Ok(self
            .pending
            .scan_index(&[])?
            .into_iter()
            .filter(|op| op.retry_count >= max_retries)
            .collect())
    }

    async fn count_pending_operations(&self) -> Result<usize, StorageError> {
        Ok(self.pending.len())
    }

    async fn add_upload_item(&self, item: &ProcessingQueueItem) -> Result<(), StorageError> {
        self.uploads.put(&item.id.to_be_bytes(), item)?;
        log::debug!(
            "Queued {} upload {} for sample '{}' ({} bytes)",
            item.kind,
            item.id,
            item.sample_id,
            item.payload.len()
        );
        Ok(())
    }

    async fn get_upload_item(&self, id: u64) -> Result<Option<ProcessingQueueItem>, StorageError> {
        self.uploads.get(&id.to_be_bytes())
    }

    async fn update_upload_item(&self, item: &ProcessingQueueItem) -> Result<(), StorageError> {
        let key = item.id.to_be_bytes();
        if self.uploads.get(&key)?.is_none() {
            return Err(StorageError::NotFound(format!("upload item {}", item.id)));
        }
        self.uploads.put(&key, item)
    }

    async fn delete_upload_item(&self, id: u64) -> Result<(), StorageError> {
        self.uploads.remove(&id.to_be_bytes())?;
        Ok(())
    }

    async fn upload_items_by_status(
        &self,
        status: UploadStatus,
    ) -> Result<Vec<ProcessingQueueItem>, StorageError> {
        self.uploads.scan_index(&[status.index_byte()])
    }

    async fn count_upload_items_by_status(
        &self,
        status: UploadStatus,
    ) -> Result<usize, StorageError> {
        self.uploads.count_index(&[status.index_byte()])
    }

    async fn get_record(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<VersionedRecord>, StorageError> {
        self.records.get(&VersionedRecord::storage_key(table, id))
    }

    async fn put_record(&self, record: &VersionedRecord) -> Result<(), StorageError> {
        self.records
            .put(&VersionedRecord::storage_key(&record.table, &record.id), record)
    }

    async fn delete_record(&self, table: &str, id: &str) -> Result<(), StorageError> {
        self.records.remove(&VersionedRecord::storage_key(table, id))?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        log::debug!("Local store flushed");
        Ok(())
    }
}
