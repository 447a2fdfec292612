use thiserror::Error;

use crate::config::ConfigError;
use crate::network::RemoteError;
use crate::storage::StorageError;

/// Errors returned by the [`SyncEngine`](crate::sync::SyncEngine) surface.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
