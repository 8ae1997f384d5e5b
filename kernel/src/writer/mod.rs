// Write Executor
//
// Pushes one batch of buffered records to a destination table, either as
// a single load job or as chunked streaming inserts. The caller's buffer
// is only borrowed: a failed write leaves every record where it was.
//
// Both modes share one row identity. For a stream with key properties a
// row replaces the stored row with the same key values, whether it was
// loaded or streamed; rows of keyless streams are appended.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::BufferedRecord;
use crate::schema::{Record, StreamSchema};
use crate::warehouse::{row_key, InsertRow, LoadJob, TableRef, Warehouse, WarehouseError};

pub mod retry;

pub use retry::{RetryError, RetryPolicy, Retryable};

/// How rows reach the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// One load job per flush. Atomic per batch.
    #[default]
    Batch,
    /// Chunked inserts, upserted by insert id.
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub rows: usize,
    pub mode: WriteMode,
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("write to {table} failed after {attempts} attempt(s): {source}")]
    LoadFailed {
        table: String,
        attempts: u32,
        #[source]
        source: WarehouseError,
    },

    #[error("write to {table} timed out after {attempts} attempt(s)")]
    Timeout { table: String, attempts: u32 },

    #[error("could not encode rows for {table}: {reason}")]
    Encode { table: String, reason: String },
}

impl WriteError {
    fn from_retry(table: &TableRef, err: RetryError<WarehouseError>) -> Self {
        match err.source {
            WarehouseError::Timeout(_) => WriteError::Timeout {
                table: table.to_string(),
                attempts: err.attempts,
            },
            source => WriteError::LoadFailed {
                table: table.to_string(),
                attempts: err.attempts,
                source,
            },
        }
    }
}

pub struct WriteExecutor {
    warehouse: Arc<dyn Warehouse>,
    mode: WriteMode,
    retry: RetryPolicy,
    timeout: Duration,
    streaming_batch_size: usize,
    run_id: Uuid,
}

impl WriteExecutor {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        mode: WriteMode,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            warehouse,
            mode,
            retry,
            timeout,
            streaming_batch_size: 500,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_streaming_batch_size(mut self, rows: usize) -> Self {
        self.streaming_batch_size = rows.max(1);
        self
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Identifier of this run, used to build insert ids for streams
    /// without key properties.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Write `records` to `table` under `schema`.
    ///
    /// Success means every record is durable at the destination.
    pub async fn write(
        &self,
        table: &TableRef,
        schema: &StreamSchema,
        records: &[BufferedRecord],
    ) -> Result<WriteReport, WriteError> {
        if records.is_empty() {
            return Ok(WriteReport {
                rows: 0,
                mode: self.mode,
            });
        }

        if !schema.key_properties.is_empty() {
            let keyless = records
                .iter()
                .filter(|r| row_key(&schema.key_properties, &r.record).is_none())
                .count();
            if keyless > 0 {
                warn!(
                    table = %table,
                    rows = keyless,
                    keys = ?schema.key_properties,
                    "records without key values are appended, not merged"
                );
            }
        }

        match self.mode {
            WriteMode::Batch => self.load(table, schema, records).await?,
            WriteMode::Streaming => self.stream(table, schema, records).await?,
        }

        info!(
            table = %table,
            rows = records.len(),
            mode = ?self.mode,
            "batch written"
        );
        Ok(WriteReport {
            rows: records.len(),
            mode: self.mode,
        })
    }

    async fn load(
        &self,
        table: &TableRef,
        schema: &StreamSchema,
        records: &[BufferedRecord],
    ) -> Result<(), WriteError> {
        let mut rows = Vec::new();
        for buffered in records {
            serde_json::to_writer(&mut rows, &schema.conform(&buffered.record)).map_err(|e| {
                WriteError::Encode {
                    table: table.to_string(),
                    reason: e.to_string(),
                }
            })?;
            rows.push(b'\n');
        }

        // One id for every attempt of this flush.
        let job = LoadJob {
            job_id: Uuid::new_v4(),
            columns: schema.columns.clone(),
            rows,
            row_count: records.len(),
            merge_key: schema.key_properties.clone(),
        };
        debug!(table = %table, job_id = %job.job_id, rows = job.row_count, "submitting load job");

        let job = &job;
        self.retry
            .run("load_rows", move || {
                self.bounded(self.warehouse.load_rows(table, job))
            })
            .await
            .map_err(|e| WriteError::from_retry(table, e))
    }

    async fn stream(
        &self,
        table: &TableRef,
        schema: &StreamSchema,
        records: &[BufferedRecord],
    ) -> Result<(), WriteError> {
        for chunk in records.chunks(self.streaming_batch_size) {
            let rows: Vec<InsertRow> = chunk
                .iter()
                .map(|buffered| {
                    let row = schema.conform(&buffered.record);
                    InsertRow {
                        insert_id: self.insert_id(schema, buffered.seq, &row),
                        row,
                    }
                })
                .collect();

            let rows = &rows;
            self.retry
                .run("insert_rows", move || {
                    self.bounded(self.warehouse.insert_rows(table, rows))
                })
                .await
                .map_err(|e| WriteError::from_retry(table, e))?;
        }
        Ok(())
    }

    /// Key values when the record has a complete key, so later rows for
    /// the same entity replace earlier ones; otherwise the record's
    /// position in this run.
    fn insert_id(&self, schema: &StreamSchema, seq: u64, row: &Record) -> String {
        row_key(&schema.key_properties, row).unwrap_or_else(|| format!("{}-{}", self.run_id, seq))
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, WarehouseError>>,
    ) -> Result<T, WarehouseError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(WarehouseError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryWarehouse, WriteFaults};
    use crate::schema::{Column, FieldType, Record};
    use crate::warehouse::DatasetRef;
    use serde_json::json;

    fn table() -> TableRef {
        DatasetRef {
            project: "p".into(),
            dataset: "d".into(),
        }
        .table("users")
    }

    fn schema(keys: &[&str]) -> StreamSchema {
        StreamSchema {
            stream: "users".into(),
            columns: vec![
                Column::new("id", FieldType::Integer),
                Column::new("name", FieldType::String),
            ],
            key_properties: keys.iter().map(|k| k.to_string()).collect(),
            version: 1,
        }
    }

    fn record(seq: u64, id: i64, name: &str) -> BufferedRecord {
        let record: Record = json!({"id": id, "name": name})
            .as_object()
            .unwrap()
            .clone();
        BufferedRecord {
            seq,
            record,
            bytes: 32,
        }
    }

    async fn warehouse() -> Arc<MemoryWarehouse> {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let dataset = DatasetRef {
            project: "p".into(),
            dataset: "d".into(),
        };
        warehouse.ensure_dataset(&dataset, "US").await.unwrap();
        warehouse
            .create_table(&table(), &schema(&[]).columns, None)
            .await
            .unwrap();
        warehouse
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
            max_elapsed: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn batch_mode_issues_one_load_job() {
        let warehouse = warehouse().await;
        let executor = WriteExecutor::new(
            warehouse.clone(),
            WriteMode::Batch,
            RetryPolicy::none(),
            Duration::from_secs(5),
        );
        let records = vec![record(1, 1, "a"), record(2, 2, "b"), record(3, 3, "c")];

        let report = executor.write(&table(), &schema(&[]), &records).await.unwrap();

        assert_eq!(report.rows, 3);
        assert_eq!(warehouse.load_jobs(), 1);
        assert_eq!(warehouse.rows(&table()).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let warehouse = warehouse().await;
        warehouse.inject_write_faults(WriteFaults {
            allow: 0,
            fail: 2,
            error: WarehouseError::Transient("backend error".into()),
        });
        let executor = WriteExecutor::new(
            warehouse.clone(),
            WriteMode::Batch,
            fast_retry(3),
            Duration::from_secs(5),
        );

        executor
            .write(&table(), &schema(&[]), &[record(1, 1, "a")])
            .await
            .unwrap();

        assert_eq!(warehouse.rows(&table()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_leave_records_with_caller() {
        let warehouse = warehouse().await;
        warehouse.inject_write_faults(WriteFaults {
            allow: 0,
            fail: 10,
            error: WarehouseError::Transient("backend error".into()),
        });
        let executor = WriteExecutor::new(
            warehouse.clone(),
            WriteMode::Batch,
            fast_retry(3),
            Duration::from_secs(5),
        );
        let records = vec![record(1, 1, "a"), record(2, 2, "b")];

        let err = executor
            .write(&table(), &schema(&[]), &records)
            .await
            .unwrap_err();

        assert!(matches!(err, WriteError::LoadFailed { attempts: 3, .. }));
        assert_eq!(records.len(), 2);
        assert!(warehouse.rows(&table()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let warehouse = warehouse().await;
        warehouse.set_write_delay(Some(Duration::from_secs(30)));
        let executor = WriteExecutor::new(
            warehouse.clone(),
            WriteMode::Batch,
            fast_retry(2),
            Duration::from_secs(1),
        );

        let err = executor
            .write(&table(), &schema(&[]), &[record(1, 1, "a")])
            .await
            .unwrap_err();

        assert!(matches!(err, WriteError::Timeout { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn streaming_chunks_and_dedupes_on_keys() {
        let warehouse = warehouse().await;
        let executor = WriteExecutor::new(
            warehouse.clone(),
            WriteMode::Streaming,
            RetryPolicy::none(),
            Duration::from_secs(5),
        )
        .with_streaming_batch_size(2);
        let records = vec![record(1, 1, "a"), record(2, 2, "b"), record(3, 3, "c")];

        executor.write(&table(), &schema(&["id"]), &records).await.unwrap();
        executor
            .write(&table(), &schema(&["id"]), &[record(4, 2, "b2")])
            .await
            .unwrap();

        assert_eq!(warehouse.insert_calls(), 3);
        let rows = warehouse.rows(&table());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1]["name"], "b2");
    }

    #[tokio::test]
    async fn batch_mode_merges_on_keys() {
        let warehouse = warehouse().await;
        let executor = WriteExecutor::new(
            warehouse.clone(),
            WriteMode::Batch,
            RetryPolicy::none(),
            Duration::from_secs(5),
        );

        executor
            .write(&table(), &schema(&["id"]), &[record(1, 1, "a"), record(2, 1, "a2")])
            .await
            .unwrap();
        executor
            .write(&table(), &schema(&["id"]), &[record(3, 2, "b")])
            .await
            .unwrap();

        let rows = warehouse.rows(&table());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "a2");
    }

    #[test]
    fn insert_ids_fall_back_to_run_and_position() {
        let executor = WriteExecutor::new(
            Arc::new(MemoryWarehouse::new()),
            WriteMode::Streaming,
            RetryPolicy::none(),
            Duration::from_secs(5),
        );
        let row = |value: serde_json::Value| -> Record { value.as_object().unwrap().clone() };

        let id = executor.insert_id(&schema(&[]), 42, &row(json!({"id": 1})));
        assert_eq!(id, format!("{}-42", executor.run_id()));

        let keyed = schema(&["id"]);
        assert_eq!(executor.insert_id(&keyed, 42, &row(json!({"id": 1}))), "[1]");
        assert_eq!(
            executor.insert_id(&keyed, 7, &row(json!({"name": "no id"}))),
            format!("{}-7", executor.run_id())
        );
        assert_eq!(
            executor.insert_id(&keyed, 8, &row(json!({"id": null}))),
            format!("{}-8", executor.run_id())
        );
    }

    #[tokio::test]
    async fn keyed_records_missing_their_key_are_kept_apart() {
        let warehouse = warehouse().await;
        let executor = WriteExecutor::new(
            warehouse.clone(),
            WriteMode::Streaming,
            RetryPolicy::none(),
            Duration::from_secs(5),
        );
        let keyless = |seq: u64, name: &str| BufferedRecord {
            seq,
            record: json!({"name": name}).as_object().unwrap().clone(),
            bytes: 16,
        };

        executor
            .write(&table(), &schema(&["id"]), &[keyless(1, "a"), keyless(2, "b")])
            .await
            .unwrap();

        assert_eq!(warehouse.rows(&table()).len(), 2);
    }
}
