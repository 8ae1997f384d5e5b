// In-Memory Warehouse
//
// Process-local destination used by tests. Mirrors the
// behaviours the pipeline depends on: row rejection for unknown columns
// at any depth, idempotent load job ids, upserts by merge key or insert
// id, plus hooks for injecting latency and write failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::schema::{Column, FieldType, Record};
use crate::warehouse::{
    row_key, DatasetRef, InsertRow, LoadJob, PartitionConfig, TableInfo, TableRef, Warehouse,
    WarehouseError,
};

/// Scripted write failures: `allow` writes succeed, then the next
/// `fail` writes return `error`.
#[derive(Debug, Clone)]
pub struct WriteFaults {
    pub allow: usize,
    pub fail: usize,
    pub error: WarehouseError,
}

#[derive(Debug, Default)]
struct MemoryTable {
    info: Option<TableInfo>,
    rows: Vec<Record>,
    /// Row index per merge key or insert id.
    by_key: HashMap<String, usize>,
}

impl MemoryTable {
    fn upsert(&mut self, key: Option<String>, row: Record) {
        match key {
            Some(key) => match self.by_key.get(&key) {
                Some(&index) => self.rows[index] = row,
                None => {
                    self.by_key.insert(key, self.rows.len());
                    self.rows.push(row);
                }
            },
            None => self.rows.push(row),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    datasets: HashMap<DatasetRef, String>,
    tables: HashMap<TableRef, MemoryTable>,
    completed_jobs: HashSet<Uuid>,
    faults: Option<WriteFaults>,
    write_delay: Option<Duration>,
    load_jobs: usize,
    insert_calls: usize,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    inner: Mutex<Inner>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inject_write_faults(&self, faults: WriteFaults) {
        self.state().faults = Some(faults);
    }

    /// Delay every write call, for exercising timeouts.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.state().write_delay = delay;
    }

    pub fn rows(&self, table: &TableRef) -> Vec<Record> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn table(&self, table: &TableRef) -> Option<TableInfo> {
        self.state().tables.get(table).and_then(|t| t.info.clone())
    }

    pub fn dataset_location(&self, dataset: &DatasetRef) -> Option<String> {
        self.state().datasets.get(dataset).cloned()
    }

    /// Committed load jobs.
    pub fn load_jobs(&self) -> usize {
        self.state().load_jobs
    }

    /// Successful streaming insert calls.
    pub fn insert_calls(&self) -> usize {
        self.state().insert_calls
    }

    async fn before_write(&self) -> Result<(), WarehouseError> {
        let delay = self.state().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(faults) = state.faults.as_mut() {
            if faults.allow > 0 {
                faults.allow -= 1;
            } else if faults.fail > 0 {
                faults.fail -= 1;
                return Err(faults.error.clone());
            }
        }
        Ok(())
    }
}

/// Reject rows the destination could not store.
fn check_row(columns: &[Column], row: &Record) -> Result<(), WarehouseError> {
    check_fields(columns, row, "")
}

fn check_fields(columns: &[Column], row: &Record, path: &str) -> Result<(), WarehouseError> {
    for (name, value) in row {
        let field = if path.is_empty() {
            name.clone()
        } else {
            format!("{path}.{name}")
        };
        let column = columns
            .iter()
            .find(|c| &c.name == name)
            .ok_or_else(|| WarehouseError::Rejected(format!("no such field: {field}")))?;

        if let Some(found) = FieldType::of_value(value) {
            if !column.field_type.accepts(found) {
                return Err(WarehouseError::Rejected(format!(
                    "field {field}: cannot store {found} in {} column",
                    column.field_type
                )));
            }
        }

        match value {
            // Object columns without fields take any shape.
            Value::Object(nested) if !column.fields.is_empty() => {
                check_fields(&column.fields, nested, &field)?;
            }
            Value::Array(items) => {
                let Some(item) = column.items.as_deref() else {
                    continue;
                };
                if item.field_type != FieldType::Object || item.fields.is_empty() {
                    continue;
                }
                let item_path = format!("{field}[]");
                for element in items {
                    if let Value::Object(nested) = element {
                        check_fields(&item.fields, nested, &item_path)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_dataset(
        &self,
        dataset: &DatasetRef,
        location: &str,
    ) -> Result<(), WarehouseError> {
        self.state()
            .datasets
            .entry(dataset.clone())
            .or_insert_with(|| location.to_string());
        Ok(())
    }

    async fn get_table(&self, table: &TableRef) -> Result<Option<TableInfo>, WarehouseError> {
        Ok(self.table(table))
    }

    async fn create_table(
        &self,
        table: &TableRef,
        columns: &[Column],
        partitioning: Option<&PartitionConfig>,
    ) -> Result<TableInfo, WarehouseError> {
        let mut state = self.state();
        let dataset = DatasetRef {
            project: table.project.clone(),
            dataset: table.dataset.clone(),
        };
        if !state.datasets.contains_key(&dataset) {
            return Err(WarehouseError::NotFound(dataset.to_string()));
        }

        let entry = state.tables.entry(table.clone()).or_default();
        if entry.info.is_some() {
            return Err(WarehouseError::AlreadyExists(table.to_string()));
        }

        let info = TableInfo {
            table: table.clone(),
            columns: columns.to_vec(),
            partitioning: partitioning.cloned(),
        };
        entry.info = Some(info.clone());
        Ok(info)
    }

    async fn update_columns(
        &self,
        table: &TableRef,
        columns: &[Column],
    ) -> Result<TableInfo, WarehouseError> {
        let mut state = self.state();
        let info = state
            .tables
            .get_mut(table)
            .and_then(|t| t.info.as_mut())
            .ok_or_else(|| WarehouseError::NotFound(table.to_string()))?;

        info.columns = columns.to_vec();
        Ok(info.clone())
    }

    async fn load_rows(&self, table: &TableRef, job: &LoadJob) -> Result<(), WarehouseError> {
        self.before_write().await?;

        let mut state = self.state();
        if state.completed_jobs.contains(&job.job_id) {
            return Ok(());
        }

        let target = state
            .tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::NotFound(table.to_string()))?;
        let columns = target
            .info
            .as_ref()
            .map(|info| info.columns.clone())
            .ok_or_else(|| WarehouseError::NotFound(table.to_string()))?;

        let mut parsed = Vec::with_capacity(job.row_count);
        for line in job.rows.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            let row: Value = serde_json::from_slice(line)?;
            let Value::Object(row) = row else {
                return Err(WarehouseError::Rejected("row is not an object".into()));
            };
            check_row(&columns, &row)?;
            parsed.push(row);
        }

        // Load jobs are atomic: nothing lands unless every row parsed.
        for row in parsed {
            target.upsert(row_key(&job.merge_key, &row), row);
        }
        state.completed_jobs.insert(job.job_id);
        state.load_jobs += 1;
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[InsertRow],
    ) -> Result<(), WarehouseError> {
        self.before_write().await?;

        let mut state = self.state();
        let target = state
            .tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::NotFound(table.to_string()))?;
        let columns = target
            .info
            .as_ref()
            .map(|info| info.columns.clone())
            .ok_or_else(|| WarehouseError::NotFound(table.to_string()))?;

        for row in rows {
            check_row(&columns, &row.row)?;
        }
        for row in rows {
            target.upsert(Some(row.insert_id.clone()), row.row.clone());
        }
        state.insert_calls += 1;
        Ok(())
    }
}
