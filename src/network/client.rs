use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::RemoteError;
use crate::storage::UploadKind;

/// Structured-record operations against a named remote collection.
#[async_trait]
pub trait RemoteSyncClient: Send + Sync {
    async fn create_remote(&self, table: &str, data: &Value) -> Result<(), RemoteError>;

    async fn update_remote(&self, table: &str, data: &Value) -> Result<(), RemoteError>;

    async fn delete_remote(&self, table: &str, id: &str) -> Result<(), RemoteError>;

    async fn upsert_remote(&self, table: &str, data: &Value) -> Result<(), RemoteError>;

    /// Whether the remote currently holds a record with this id.
    async fn verify_sync(&self, table: &str, id: &str) -> Result<bool, RemoteError>;

    /// Current remote copy of a record, if any.
    async fn fetch_remote(&self, table: &str, id: &str) -> Result<Option<Value>, RemoteError>;
}

/// Binary payload uploads to the remote object store.
#[async_trait]
pub trait RemoteFileStore: Send + Sync {
    async fn upload_file(
        &self,
        kind: UploadKind,
        path: &str,
        payload: &[u8],
    ) -> Result<(), RemoteError>;
}

/// Bound a remote call by `limit`; an elapsed timer becomes
/// [`RemoteError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout),
    }
}
