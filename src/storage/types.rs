use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::HybridTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Upsert,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Upsert => "upsert",
        };
        f.write_str(name)
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            "upsert" => Ok(OperationType::Upsert),
            other => Err(format!("unknown operation type '{other}'")),
        }
    }
}

/// A mutation that could not be confirmed against the remote and waits in
/// the operation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: u64,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub table: String,
    #[serde(with = "crate::common::json_text")]
    pub data: Value,
    pub timestamp: HybridTimestamp,
    pub retry_count: u32,
}

impl PendingOperation {
    /// The `id` field of the payload, as used by the remote collection.
    pub fn record_id(&self) -> Option<String> {
        record_id(&self.data)
    }
}

/// Extracts a record id from a JSON payload. Numeric ids are accepted and
/// rendered in decimal.
pub fn record_id(data: &Value) -> Option<String> {
    match data.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    Raw,
    Processed,
}

impl fmt::Display for UploadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadKind::Raw => f.write_str("raw"),
            UploadKind::Processed => f.write_str("processed"),
        }
    }
}

impl FromStr for UploadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(UploadKind::Raw),
            "processed" => Ok(UploadKind::Processed),
            other => Err(format!("unknown upload kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Error,
}

impl UploadStatus {
    /// Leading byte of the status index key.
    pub fn index_byte(self) -> u8 {
        match self {
            UploadStatus::Pending => 0,
            UploadStatus::Uploading => 1,
            UploadStatus::Error => 2,
        }
    }
}

/// A binary payload waiting to be uploaded to the remote object store.
///
/// An item in `Error` status always carries an `error` message and a
/// non-zero `retry_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingQueueItem {
    pub id: u64,
    pub kind: UploadKind,
    pub sample_id: String,
    pub config_id: String,
    pub file_path: String,
    pub payload: Vec<u8>,
    pub timestamp: HybridTimestamp,
    pub retry_count: u32,
    pub status: UploadStatus,
    pub error: Option<String>,
}

impl ProcessingQueueItem {
    /// Last path segment of the remote target, used in progress messages.
    pub fn file_name(&self) -> &str {
        self.file_path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(self.file_path.as_str())
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = UploadStatus::Error;
        self.error = Some(message.into());
        self.retry_count = self.retry_count.saturating_add(1);
    }
}

/// Locally cached copy of a structured record guarded by a version counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub table: String,
    pub id: String,
    pub version: u64,
    pub updated_at: u64,
    #[serde(with = "crate::common::json_text")]
    pub fields: Value,
}

impl VersionedRecord {
    /// Builds a record from a remote row. Rows without an id are rejected;
    /// a missing or non-numeric version is read as 0.
    pub fn from_remote(table: &str, row: Value) -> Option<Self> {
        let id = record_id(&row)?;
        let version = row.get("version").and_then(Value::as_u64).unwrap_or(0);
        let updated_at = row.get("updated_at").and_then(Value::as_u64).unwrap_or(0);
        Some(Self {
            table: table.to_string(),
            id,
            version,
            updated_at,
            fields: row,
        })
    }

    /// Payload pushed to the remote: the record's fields with `id`,
    /// `version` and `updated_at` stamped in.
    pub fn to_payload(&self) -> Value {
        let mut payload = match &self.fields {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        payload.insert("id".to_string(), Value::String(self.id.clone()));
        payload.insert("version".to_string(), Value::from(self.version));
        payload.insert("updated_at".to_string(), Value::from(self.updated_at));
        Value::Object(payload)
    }

    pub fn storage_key(table: &str, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(table.len() + id.len() + 1);
        key.extend_from_slice(table.as_bytes());
        key.push(0);
        key.extend_from_slice(id.as_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_id_accepts_strings_and_numbers() {
        assert_eq!(record_id(&json!({"id": "abc"})), Some("abc".to_string()));
        assert_eq!(record_id(&json!({"id": 42})), Some("42".to_string()));
        assert_eq!(record_id(&json!({"id": ""})), None);
        assert_eq!(record_id(&json!({"name": "x"})), None);
        assert_eq!(record_id(&json!([1, 2])), None);
    }

    #[test]
    fn operation_type_parses_case_insensitively() {
        assert_eq!("Upsert".parse::<OperationType>(), Ok(OperationType::Upsert));
        assert_eq!(OperationType::Delete.to_string(), "delete");
        assert!("merge".parse::<OperationType>().is_err());
    }

    #[test]
    fn remote_row_round_trips_through_payload() {
        let row = json!({"id": "n-1", "version": 3, "updated_at": 1700, "name": "Site A"});
        let record = VersionedRecord::from_remote("tree_nodes", row).unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.updated_at, 1700);

        let payload = record.to_payload();
        assert_eq!(payload["name"], "Site A");
        assert_eq!(payload["version"], 3);
        assert_eq!(payload["id"], "n-1");
    }

    #[test]
    fn mark_error_keeps_status_invariant() {
        let mut item = ProcessingQueueItem {
            id: 1,
            kind: UploadKind::Raw,
            sample_id: "s".into(),
            config_id: "c".into(),
            file_path: "samples/s/raw/reads.fastq".into(),
            payload: vec![1, 2, 3],
            timestamp: crate::common::Clock::new().now(),
            retry_count: 0,
            status: UploadStatus::Pending,
            error: None,
        };

        item.mark_error("boom");
        assert_eq!(item.status, UploadStatus::Error);
        assert_eq!(item.error.as_deref(), Some("boom"));
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.file_name(), "reads.fastq");
    }
}
