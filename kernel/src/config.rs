// Target Configuration
//
// JSON configuration for a run. Every key has a documented default
// except the destination project and dataset. Validation happens once,
// before any input is read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::FlushPolicy;
use crate::provision::TableNaming;
use crate::schema::{InvalidRecordPolicy, RegistryOptions, TypeNames};
use crate::warehouse::{DatasetRef, PartitionConfig, PartitionGranularity};
use crate::writer::{RetryPolicy, WriteMode};

const NUMERIC_TYPES: &[&str] = &["NUMERIC", "BIGNUMERIC", "FLOAT64"];
const INTEGER_TYPES: &[&str] = &["INT64", "INTEGER", "NUMERIC"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Run configuration, as read from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub project_id: String,
    pub dataset_id: String,
    pub location: String,

    pub table_prefix: Option<String>,
    pub table_ext: Option<String>,

    pub partition_by: Option<String>,
    pub partition_type: PartitionGranularity,
    pub partition_exp_ms: Option<u64>,

    /// Streaming inserts instead of load jobs.
    pub stream: bool,
    pub on_invalid_record: InvalidRecordPolicy,
    pub strict_schema: bool,

    pub numeric_type: String,
    pub integer_type: String,

    pub batch_size_rows: usize,
    pub batch_size_bytes: usize,
    pub flush_interval_secs: u64,
    pub streaming_batch_size: usize,

    pub write_timeout_secs: u64,
    /// Total attempts per write, including the first.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_max_elapsed_secs: u64,

    pub max_parallel_flushes: usize,
    pub channel_capacity: usize,
    pub shutdown_grace_secs: u64,

    /// Root of the local warehouse used by the binary.
    pub warehouse_dir: Option<PathBuf>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            dataset_id: String::new(),
            location: "US".into(),
            table_prefix: None,
            table_ext: None,
            partition_by: None,
            partition_type: PartitionGranularity::Day,
            partition_exp_ms: None,
            stream: false,
            on_invalid_record: InvalidRecordPolicy::Abort,
            strict_schema: false,
            numeric_type: "NUMERIC".into(),
            integer_type: "INT64".into(),
            batch_size_rows: 10_000,
            batch_size_bytes: 64 * 1024 * 1024,
            flush_interval_secs: 60,
            streaming_batch_size: 500,
            write_timeout_secs: 300,
            max_retries: 5,
            retry_backoff_ms: 1_000,
            retry_max_elapsed_secs: 900,
            max_parallel_flushes: 4,
            channel_capacity: 1024,
            shutdown_grace_secs: 30,
            warehouse_dir: None,
        }
    }
}

impl TargetConfig {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        let config: TargetConfig = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Missing("project_id"));
        }
        if self.dataset_id.trim().is_empty() {
            return Err(ConfigError::Missing("dataset_id"));
        }

        let nonzero: [(&'static str, u64); 7] = [
            ("batch_size_rows", self.batch_size_rows as u64),
            ("batch_size_bytes", self.batch_size_bytes as u64),
            ("flush_interval_secs", self.flush_interval_secs),
            ("streaming_batch_size", self.streaming_batch_size as u64),
            ("write_timeout_secs", self.write_timeout_secs),
            ("max_retries", u64::from(self.max_retries)),
            ("max_parallel_flushes", self.max_parallel_flushes as u64),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "channel_capacity",
                reason: "must be greater than zero".into(),
            });
        }

        check_choice("numeric_type", &self.numeric_type, NUMERIC_TYPES)?;
        check_choice("integer_type", &self.integer_type, INTEGER_TYPES)?;

        if let Some(column) = &self.partition_by {
            if column.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "partition_by",
                    reason: "column name is empty".into(),
                });
            }
        }
        Ok(())
    }

    pub fn dataset(&self) -> DatasetRef {
        DatasetRef {
            project: self.project_id.clone(),
            dataset: self.dataset_id.clone(),
        }
    }

    pub fn table_naming(&self) -> TableNaming {
        TableNaming {
            prefix: self.table_prefix.clone(),
            ext: self.table_ext.clone(),
        }
    }

    pub fn partition(&self) -> Option<PartitionConfig> {
        self.partition_by.as_ref().map(|column| PartitionConfig {
            column: column.clone(),
            granularity: self.partition_type,
            expiration_ms: self.partition_exp_ms,
        })
    }

    pub fn write_mode(&self) -> WriteMode {
        if self.stream {
            WriteMode::Streaming
        } else {
            WriteMode::Batch
        }
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            max_records: self.batch_size_rows,
            max_bytes: self.batch_size_bytes,
            max_age: Duration::from_secs(self.flush_interval_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(self.retry_max_elapsed_secs),
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            strict: self.strict_schema,
            on_invalid: self.on_invalid_record,
        }
    }

    pub fn type_names(&self) -> TypeNames {
        TypeNames {
            numeric: self.numeric_type.to_ascii_uppercase(),
            integer: self.integer_type.to_ascii_uppercase(),
        }
    }
}

fn check_choice(field: &'static str, value: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
        return Ok(());
    }
    Err(ConfigError::Invalid {
        field,
        reason: format!("`{value}` is not one of {}", allowed.join(", ")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_everything_but_destination() {
        let config =
            TargetConfig::from_json_str(r#"{"project_id": "acme", "dataset_id": "raw"}"#).unwrap();

        assert_eq!(config.location, "US");
        assert_eq!(config.write_mode(), WriteMode::Batch);
        assert_eq!(config.flush_policy(), FlushPolicy::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.partition(), None);
        assert_eq!(config.type_names(), TypeNames::default());
    }

    #[test]
    fn missing_dataset_is_rejected() {
        let err = TargetConfig::from_json_str(r#"{"project_id": "acme"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("dataset_id")));
    }

    #[test]
    fn partition_and_mode_options() {
        let config = TargetConfig::from_json_str(
            r#"{
                "project_id": "acme",
                "dataset_id": "raw",
                "partition_by": "created_at",
                "partition_type": "month",
                "partition_exp_ms": 86400000,
                "stream": true,
                "on_invalid_record": "skip"
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.partition(),
            Some(PartitionConfig {
                column: "created_at".into(),
                granularity: PartitionGranularity::Month,
                expiration_ms: Some(86_400_000),
            })
        );
        assert_eq!(config.write_mode(), WriteMode::Streaming);
        assert_eq!(config.registry_options().on_invalid, InvalidRecordPolicy::Skip);
    }

    #[test]
    fn unknown_partition_type_fails_to_parse() {
        let err = TargetConfig::from_json_str(
            r#"{"project_id": "a", "dataset_id": "b", "partition_type": "week"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn numeric_type_must_be_known() {
        let err = TargetConfig::from_json_str(
            r#"{"project_id": "a", "dataset_id": "b", "numeric_type": "DECIMAL"}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "numeric_type",
                ..
            }
        ));
    }

    #[test]
    fn zero_thresholds_are_invalid() {
        let err = TargetConfig::from_json_str(
            r#"{"project_id": "a", "dataset_id": "b", "batch_size_rows": 0}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "batch_size_rows",
                ..
            }
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TargetConfig::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
