// Local-first storage and sync layers
pub mod common;
pub mod config;
pub mod error;
pub mod storage;

// Remote backend and the sync engine built on it
pub mod network;
pub mod sync;

// Public exports
pub use config::Config;
pub use error::EngineError;
pub use storage::{SledStore, Storage};
pub use sync::{SyncEngine, EngineHandle};
