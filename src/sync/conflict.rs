use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::network::{with_timeout, NetworkMonitor, RemoteSyncClient};
use crate::storage::{Storage, StorageError, VersionedRecord};

/// Outcome of comparing an editor's base version with the visible one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Accept { next_version: u64 },
    Discard { visible_version: u64 },
}

/// A newer visible version always wins; otherwise the edit is accepted and
/// bumps the version by exactly one.
pub fn resolve(base_version: u64, visible_version: Option<u64>) -> Resolution {
    match visible_version {
        Some(visible) if visible > base_version => Resolution::Discard {
            visible_version: visible,
        },
        _ => Resolution::Accept {
            next_version: base_version.saturating_add(1),
        },
    }
}

/// A local edit of a versioned record, made against `base_version`.
#[derive(Debug, Clone)]
pub struct RecordEdit {
    pub table: String,
    pub id: String,
    pub base_version: u64,
    pub fields: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// The edit was stored with its new version and handed to sync.
    Accepted(VersionedRecord),
    /// A newer copy existed; it replaced the local one and the edit was
    /// dropped.
    Discarded(VersionedRecord),
}

/// Apply `resolve` to an edit and the record currently visible for it.
pub fn settle(edit: RecordEdit, visible: Option<VersionedRecord>, now: u64) -> SaveOutcome {
    let visible_version = visible.as_ref().map(|record| record.version);
    match (resolve(edit.base_version, visible_version), visible) {
        (Resolution::Discard { .. }, Some(record)) => SaveOutcome::Discarded(record),
        _ => SaveOutcome::Accepted(VersionedRecord {
            table: edit.table,
            id: edit.id,
            version: edit.base_version.saturating_add(1),
            updated_at: now,
            fields: edit.fields,
        }),
    }
}

/// Looks up the version of a record an edit has to beat.
pub struct ConflictResolver {
    storage: Arc<dyn Storage>,
    remote: Arc<dyn RemoteSyncClient>,
    monitor: Arc<NetworkMonitor>,
    request_timeout: Duration,
}

impl ConflictResolver {
    pub fn new(
        storage: Arc<dyn Storage>,
        remote: Arc<dyn RemoteSyncClient>,
        monitor: Arc<NetworkMonitor>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            remote,
            monitor,
            request_timeout,
        }
    }

    /// Highest-versioned copy among the local cache and, when the remote is
    /// reachable, the remote row. A failed fetch falls back to the local copy.
    pub async fn visible_record(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<VersionedRecord>, StorageError> {
        let local = self.storage.get_record(table, id).await?;
        if !self.monitor.has_active_connection().await {
            return Ok(local);
        }

        let remote = match with_timeout(self.request_timeout, self.remote.fetch_remote(table, id)).await {
            Ok(row) => row.and_then(|row| VersionedRecord::from_remote(table, row)),
            Err(e) => {
                log::warn!("Cannot fetch {table}/{id} for version check, using local copy: {e}");
                None
            }
        };

        Ok(match (local, remote) {
            (Some(local), Some(remote)) if remote.version > local.version => Some(remote),
            (Some(local), _) => Some(local),
            (None, remote) => remote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edit(base_version: u64) -> RecordEdit {
        RecordEdit {
            table: "tree_nodes".into(),
            id: "n-1".into(),
            base_version,
            fields: json!({"name": "local"}),
        }
    }

    fn visible(version: u64) -> VersionedRecord {
        VersionedRecord {
            table: "tree_nodes".into(),
            id: "n-1".into(),
            version,
            updated_at: 10,
            fields: json!({"name": "remote"}),
        }
    }

    #[test]
    fn newer_visible_version_wins() {
        assert_eq!(resolve(2, Some(3)), Resolution::Discard { visible_version: 3 });
        assert_eq!(resolve(3, Some(3)), Resolution::Accept { next_version: 4 });
        assert_eq!(resolve(5, Some(3)), Resolution::Accept { next_version: 6 });
        assert_eq!(resolve(0, None), Resolution::Accept { next_version: 1 });
    }

    #[test]
    fn settle_keeps_visible_record_on_conflict() {
        match settle(edit(2), Some(visible(3)), 99) {
            SaveOutcome::Discarded(record) => {
                assert_eq!(record.version, 3);
                assert_eq!(record.fields["name"], "remote");
            }
            other => panic!("expected discard, got {other:?}"),
        }
    }

    #[test]
    fn settle_bumps_version_once_on_accept() {
        match settle(edit(3), Some(visible(3)), 99) {
            SaveOutcome::Accepted(record) => {
                assert_eq!(record.version, 4);
                assert_eq!(record.updated_at, 99);
                assert_eq!(record.fields["name"], "local");
            }
            other => panic!("expected accept, got {other:?}"),
        }
    }
}
