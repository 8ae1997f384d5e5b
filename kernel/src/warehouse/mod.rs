// Warehouse Abstraction
//
// The destination contract used by the provisioner and the write
// executor. Concrete clients live in `crate::adapters`.
//
// Implementations must guarantee that a successful `load_rows` or
// `insert_rows` is durable: visible to later reads, or queued in a way
// the destination itself guarantees will become visible.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::schema::{Column, Record};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetRef {
    pub project: String,
    pub dataset: String,
}

impl DatasetRef {
    pub fn table(&self, table: impl Into<String>) -> TableRef {
        TableRef {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            table: table.into(),
        }
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.dataset)
    }
}

/// Fully qualified destination table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionGranularity {
    Hour,
    #[default]
    Day,
    Month,
    Year,
}

/// Time partitioning, fixed when the table is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub column: String,
    pub granularity: PartitionGranularity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_ms: Option<u64>,
}

/// Destination table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table: TableRef,
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitioning: Option<PartitionConfig>,
}

/// A bulk load of newline-delimited JSON rows.
///
/// The job id is stable across retries of the same flush, so a load
/// that committed but whose acknowledgment was lost is not applied twice.
///
/// With a non-empty `merge_key`, a row whose key is complete replaces the
/// stored row with the same key (see [`row_key`]); later rows in the same
/// job win. Rows without a complete key are appended.
#[derive(Debug, Clone)]
pub struct LoadJob {
    pub job_id: Uuid,
    pub columns: Vec<Column>,
    pub rows: Vec<u8>,
    pub row_count: usize,
    pub merge_key: Vec<String>,
}

/// Identity of `row` under `key`: the JSON array of its key values.
///
/// `None` when there is no key or any key value is missing or null.
/// Streaming insert ids for keyed streams use the same form, so a row
/// loaded in batch mode and one streamed share an identity.
pub fn row_key(key: &[String], row: &Record) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    let mut values = Vec::with_capacity(key.len());
    for name in key {
        match row.get(name) {
            None | Some(Value::Null) => return None,
            Some(value) => values.push(value.clone()),
        }
    }
    Some(Value::Array(values).to_string())
}

/// One row for the streaming insert path.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    /// A later row replaces a stored row with the same insert id.
    pub insert_id: String,
    pub row: Record,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WarehouseError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("rejected by warehouse: {0}")]
    Rejected(String),

    #[error("transient warehouse failure: {0}")]
    Transient(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(String),
}

impl WarehouseError {
    /// Failures worth another attempt. Rejections are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WarehouseError::Transient(_)
                | WarehouseError::RateLimited(_)
                | WarehouseError::Timeout(_)
                | WarehouseError::Io(_)
        )
    }
}

impl From<std::io::Error> for WarehouseError {
    fn from(err: std::io::Error) -> Self {
        WarehouseError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for WarehouseError {
    fn from(err: serde_json::Error) -> Self {
        WarehouseError::Rejected(err.to_string())
    }
}

/// Destination warehouse client.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the dataset if it does not exist yet.
    async fn ensure_dataset(&self, dataset: &DatasetRef, location: &str)
        -> Result<(), WarehouseError>;

    async fn get_table(&self, table: &TableRef) -> Result<Option<TableInfo>, WarehouseError>;

    /// Fails with `AlreadyExists` if another writer created it first.
    async fn create_table(
        &self,
        table: &TableRef,
        columns: &[Column],
        partitioning: Option<&PartitionConfig>,
    ) -> Result<TableInfo, WarehouseError>;

    /// Replace the column list. Callers only ever pass additive changes.
    async fn update_columns(
        &self,
        table: &TableRef,
        columns: &[Column],
    ) -> Result<TableInfo, WarehouseError>;

    /// Run a bulk load job and wait for it to commit.
    async fn load_rows(&self, table: &TableRef, job: &LoadJob) -> Result<(), WarehouseError>;

    /// Stream rows through the low-latency insert path.
    async fn insert_rows(&self, table: &TableRef, rows: &[InsertRow])
        -> Result<(), WarehouseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ref_display() {
        let dataset = DatasetRef {
            project: "acme".into(),
            dataset: "raw".into(),
        };
        assert_eq!(dataset.table("users").to_string(), "acme.raw.users");
    }

    #[test]
    fn retry_classification() {
        assert!(WarehouseError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(WarehouseError::RateLimited("quota".into()).is_retryable());
        assert!(!WarehouseError::Rejected("bad row".into()).is_retryable());
        assert!(!WarehouseError::NotFound("t".into()).is_retryable());
    }

    #[test]
    fn row_key_needs_every_key_value() {
        let row = |value: serde_json::Value| value.as_object().unwrap().clone();
        let key = vec!["id".to_string(), "region".to_string()];

        assert_eq!(
            row_key(&key, &row(serde_json::json!({"id": 1, "region": "eu", "x": 2}))),
            Some(r#"[1,"eu"]"#.to_string())
        );
        assert_eq!(row_key(&key, &row(serde_json::json!({"id": 1}))), None);
        assert_eq!(
            row_key(&key, &row(serde_json::json!({"id": 1, "region": null}))),
            None
        );
        assert_eq!(row_key(&[], &row(serde_json::json!({"id": 1}))), None);
    }

    #[test]
    fn partition_config_json() {
        let config: PartitionConfig =
            serde_json::from_str(r#"{"column":"ts","granularity":"month"}"#).unwrap();
        assert_eq!(config.granularity, PartitionGranularity::Month);
        assert_eq!(config.expiration_ms, None);
    }
}
