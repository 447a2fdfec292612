pub mod backoff;
pub mod conflict;
pub mod engine;
pub mod manager;
pub mod operation_queue;
pub mod upload;

pub use backoff::Backoff;
pub use conflict::{resolve, ConflictResolver, RecordEdit, Resolution, SaveOutcome};
pub use engine::{Delivery, EngineHandle, SyncEngine};
pub use manager::{push_operation, DrainReport, StopReason, SyncManager, SyncState};
pub use operation_queue::{NewOperation, OperationQueue};
pub use upload::{
    NewUpload, UploadManager, UploadOutcome, UploadProgress, UploadReport, CANCELLED_MESSAGE,
    OFFLINE_MESSAGE,
};
