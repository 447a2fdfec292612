use std::sync::Arc;

use serde_json::Value;

use crate::common::Clock;
use crate::storage::{OperationType, PendingOperation, Storage, StorageError};

/// A mutation handed to the queue; id, timestamp and retry count are
/// assigned on enqueue.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub op_type: OperationType,
    pub table: String,
    pub data: Value,
}

impl NewOperation {
    pub fn new(op_type: OperationType, table: impl Into<String>, data: Value) -> Self {
        Self {
            op_type,
            table: table.into(),
            data,
        }
    }
}

/// FIFO view over the persisted pending-operation log.
///
/// Operations are dequeued strictly in enqueue order. `dequeue` only peeks:
/// an operation leaves the log through `remove`.
pub struct OperationQueue {
    storage: Arc<dyn Storage>,
    clock: Clock,
    max_retries: u32,
}

impl OperationQueue {
    pub fn new(storage: Arc<dyn Storage>, max_retries: u32) -> Self {
        Self {
            storage,
            clock: Clock::new(),
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn enqueue(&self, op: NewOperation) -> Result<PendingOperation, StorageError> {
        let pending = PendingOperation {
            id: self.storage.next_id().await?,
            op_type: op.op_type,
            table: op.table,
            data: op.data,
            timestamp: self.clock.now(),
            retry_count: 0,
        };
        self.storage.add_pending_operation(&pending).await?;

        log::info!(
            "Queued {} on '{}' as operation {}",
            pending.op_type,
            pending.table,
            pending.id
        );
        Ok(pending)
    }

    /// Oldest operation still in the log.
    pub async fn dequeue(&self) -> Result<Option<PendingOperation>, StorageError> {
        self.storage.oldest_pending_operation().await
    }

    pub async fn remove(&self, id: u64) -> Result<(), StorageError> {
        self.storage.delete_pending_operation(id).await
    }

    pub fn should_retry(&self, op: &PendingOperation) -> bool {
        op.retry_count < self.max_retries
    }

    /// Persist one more failed attempt and return the updated operation.
    pub async fn update_retry_count(
        &self,
        op: &PendingOperation,
    ) -> Result<PendingOperation, StorageError> {
        let mut updated = op.clone();
        updated.retry_count = op.retry_count.saturating_add(1);
        self.storage.update_pending_operation(&updated).await?;
        Ok(updated)
    }

    pub async fn pending(&self) -> Result<Vec<PendingOperation>, StorageError> {
        self.storage.pending_operations_by_timestamp().await
    }

    pub async fn len(&self) -> Result<usize, StorageError> {
        self.storage.count_pending_operations().await
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    /// Operations that have used up their retry budget.
    pub async fn failed(&self) -> Result<Vec<PendingOperation>, StorageError> {
        self.storage.failed_operations(self.max_retries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledStore;
    use serde_json::json;

    fn queue() -> OperationQueue {
        OperationQueue::new(Arc::new(SledStore::temporary().unwrap()), 3)
    }

    #[tokio::test]
    async fn dequeue_peeks_oldest_until_removed() {
        let queue = queue();
        let a = queue
            .enqueue(NewOperation::new(OperationType::Create, "samples", json!({"id": "a"})))
            .await
            .unwrap();
        let b = queue
            .enqueue(NewOperation::new(OperationType::Update, "samples", json!({"id": "a"})))
            .await
            .unwrap();

        assert_eq!(a.retry_count, 0);
        assert!(b.timestamp > a.timestamp);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, a.id);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, a.id);

        queue.remove(a.id).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, b.id);
        queue.remove(b.id).await.unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn retry_accounting_stops_at_ceiling() {
        let queue = queue();
        let mut op = queue
            .enqueue(NewOperation::new(OperationType::Delete, "locations", json!({"id": 7})))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while queue.should_retry(&op) {
            op = queue.update_retry_count(&op).await.unwrap();
            seen.push(op.retry_count);
        }

        assert_eq!(seen, vec![1, 2, 3]);
        let stored = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
        assert_eq!(queue.failed().await.unwrap().len(), 1);
    }
}
