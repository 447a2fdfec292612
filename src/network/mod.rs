mod error;

pub mod client;
pub mod connectivity;
pub mod http_client;
pub mod sync_status;

pub use client::{with_timeout, RemoteFileStore, RemoteSyncClient};
pub use connectivity::{
    ConnectionStrength, ConnectivityState, ListenerId, NetworkMonitor, NetworkState,
    ReachabilityProbe,
};
pub use error::RemoteError;
pub use http_client::HttpRemoteClient;
pub use sync_status::{QueueStats, SharedSyncStats, SyncStats};
