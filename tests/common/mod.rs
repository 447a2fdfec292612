#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;

use fieldsync::network::{ReachabilityProbe, RemoteError, RemoteFileStore, RemoteSyncClient};
use fieldsync::storage::{
    record_id, PendingOperation, ProcessingQueueItem, SledStore, Storage, StorageError,
    UploadKind, UploadStatus, VersionedRecord,
};
use fieldsync::{Config, SyncEngine};

/// In-memory remote collections. Writes for ids marked with `reject` fail
/// with a 422; every call is logged as "<call> <table>/<id>".
#[derive(Default)]
pub struct MockRemote {
    rows: Mutex<HashMap<(String, String), Value>>,
    calls: Mutex<Vec<String>>,
    rejected: Mutex<HashSet<String>>,
    lost: Mutex<HashSet<String>>,
    write_delay: Mutex<Duration>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self, id: &str) {
        self.rejected.lock().unwrap().insert(id.to_string());
    }

    /// Acknowledge writes for `id` without storing them.
    pub fn lose_writes(&self, id: &str) {
        self.lost.lock().unwrap().insert(id.to_string());
    }

    pub fn accept(&self, id: &str) {
        self.rejected.lock().unwrap().remove(id);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn insert_row(&self, table: &str, row: Value) {
        let id = record_id(&row).expect("row id");
        self.rows
            .lock()
            .unwrap()
            .insert((table.to_string(), id), row);
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Value> {
        self.rows
            .lock()
            .unwrap()
            .get(&(table.to_string(), id.to_string()))
            .cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that change remote state.
    pub fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("verify") && !c.starts_with("fetch"))
            .collect()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn log(&self, call: &str, table: &str, id: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{call} {table}/{id}"));
    }

    async fn write(&self, call: &str, table: &str, data: &Value) -> Result<(), RemoteError> {
        let id = record_id(data).ok_or_else(|| RemoteError::InvalidRequest("no id".into()))?;
        self.log(call, table, &id);

        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        if self.rejected.lock().unwrap().contains(&id) {
            return Err(RemoteError::Rejected {
                status: 422,
                message: format!("{id} rejected"),
            });
        }
        if self.lost.lock().unwrap().contains(&id) {
            return Ok(());
        }
        self.rows
            .lock()
            .unwrap()
            .insert((table.to_string(), id), data.clone());
        Ok(())
    }
}

#[async_trait]
impl RemoteSyncClient for MockRemote {
    async fn create_remote(&self, table: &str, data: &Value) -> Result<(), RemoteError> {
        self.write("create", table, data).await
    }

    async fn update_remote(&self, table: &str, data: &Value) -> Result<(), RemoteError> {
        self.write("update", table, data).await
    }

    async fn delete_remote(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.log("delete", table, id);
        if self.rejected.lock().unwrap().contains(id) {
            return Err(RemoteError::Rejected {
                status: 422,
                message: format!("{id} rejected"),
            });
        }
        self.rows
            .lock()
            .unwrap()
            .remove(&(table.to_string(), id.to_string()));
        Ok(())
    }

    async fn upsert_remote(&self, table: &str, data: &Value) -> Result<(), RemoteError> {
        self.write("upsert", table, data).await
    }

    async fn verify_sync(&self, table: &str, id: &str) -> Result<bool, RemoteError> {
        self.log("verify", table, id);
        Ok(self.row(table, id).is_some())
    }

    async fn fetch_remote(&self, table: &str, id: &str) -> Result<Option<Value>, RemoteError> {
        self.log("fetch", table, id);
        Ok(self.row(table, id))
    }
}

/// Object store that records concurrency. Each upload takes `delay`.
#[derive(Default)]
pub struct MockFileStore {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    attempts: AtomicUsize,
    uploaded: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
}

impl MockFileStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fail_path(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteFileStore for MockFileStore {
    async fn upload_file(
        &self,
        _kind: UploadKind,
        path: &str,
        _payload: &[u8],
    ) -> Result<(), RemoteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(path) {
            return Err(RemoteError::Transient("connection reset".into()));
        }
        self.uploaded.lock().unwrap().push(path.to_string());
        Ok(())
    }
}

pub struct StaticProbe {
    up: AtomicBool,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub fn new(up: bool) -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(up),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn probe(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Transient("no route to host".into()))
        }
    }
}

/// Store wrapper that counts calls and can be switched to fail every call.
pub struct CountingStorage {
    inner: SledStore,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl CountingStorage {
    pub fn new(inner: SledStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub fn temporary() -> Arc<Self> {
        Self::new(SledStore::temporary().expect("temporary store"))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn tick(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::SledError("injected fault".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for CountingStorage {
    async fn next_id(&self) -> Result<u64, StorageError> {
        self.tick()?;
        self.inner.next_id().await
    }

    async fn add_pending_operation(&self, op: &PendingOperation) -> Result<(), StorageError> {
        self.tick()?;
        self.inner.add_pending_operation(op).await
    }

    async fn pending_operations_by_timestamp(&self) -> Result<Vec<PendingOperation>, StorageError> {
        self.tick()?;
        self.inner.pending_operations_by_timestamp().await
    }

    async fn oldest_pending_operation(&self) -> Result<Option<PendingOperation>, StorageError> {
        self.tick()?;
        self.inner.oldest_pending_operation().await
    }

    async fn update_pending_operation(&self, op: &PendingOperation) -> Result<(), StorageError> {
        self.tick()?;
        self.inner.update_pending_operation(op).await
    }

    async fn delete_pending_operation(&self, id: u64) -> Result<(), StorageError> {
        self.tick()?;
        self.inner.delete_pending_operation(id).await
    }

    async fn failed_operations(
        &self,
        max_retries: u32,
    ) -> Result<Vec<PendingOperation>, StorageError> {
        self.tick()?;
        self.inner.failed_operations(max_retries).await
    }

    async fn count_pending_operations(&self) -> Result<usize, StorageError> {
        self.tick()?;
        self.inner.count_pending_operations().await
    }

    async fn add_upload_item(&self, item: &ProcessingQueueItem) -> Result<(), StorageError> {
        self.tick()?;
        self.inner.add_upload_item(item).await
    }

    async fn get_upload_item(&self, id: u64) -> Result<Option<ProcessingQueueItem>, StorageError> {
        self.tick()?;
        self.inner.get_upload_item(id).await
    }

    async fn update_upload_item(&self, item: &ProcessingQueueItem) -> Result<(), StorageError> {
        self.tick()?;
        self.inner.update_upload_item(item).await
    }

    async fn delete_upload_item(&self, id: u64) -> Result<(), StorageError> {
        self.tick()?;
        self.inner.delete_upload_item(id).await
    }

    async fn upload_items_by_status(
        &self,
        status: UploadStatus,
    ) -> Result<Vec<ProcessingQueueItem>, StorageError> {
        self.tick()?;
        self.inner.upload_items_by_status(status).await
    }

    async fn count_upload_items_by_status(
        &self,
        status: UploadStatus,
    ) -> Result<usize, StorageError> {
        self.tick()?;
        self.inner.count_upload_items_by_status(status).await
    }

    async fn get_record(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<VersionedRecord>, StorageError> {
        self.tick()?;
        self.inner.get_record(table, id).await
    }

    async fn put_record(&self, record: &VersionedRecord) -> Result<(), StorageError> {
        self.tick()?;
        self.inner.put_record(record).await
    }

    async fn delete_record(&self, table: &str, id: &str) -> Result<(), StorageError> {
        self.tick()?;
        self.inner.delete_record(table, id).await
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.tick()?;
        self.inner.flush().await
    }
}

/// Defaults with background uploads on reconnect turned off so tests decide
/// when upload passes run.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.upload.upload_on_reconnect = false;
    config
}

pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub storage: Arc<CountingStorage>,
    pub remote: Arc<MockRemote>,
    pub files: Arc<MockFileStore>,
    pub probe: Arc<StaticProbe>,
}

pub fn harness(config: Config, online: bool) -> Harness {
    harness_with_store(config, online, CountingStorage::temporary())
}

pub fn harness_with_store(config: Config, online: bool, storage: Arc<CountingStorage>) -> Harness {
    let remote = MockRemote::new();
    let files = MockFileStore::new();
    let probe = StaticProbe::new(online);

    let engine = SyncEngine::new(
        config,
        storage.clone(),
        remote.clone(),
        files.clone(),
        probe.clone(),
    );

    Harness {
        engine: Arc::new(engine),
        storage,
        remote,
        files,
        probe,
    }
}
