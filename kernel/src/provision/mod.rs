// Table Provisioner
//
// Makes sure a stream's destination table exists and carries every
// column the stream needs. Tables only ever grow; partitioning is set
// when a table is created and never revisited.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::schema::{Column, FieldType, StreamSchema};
use crate::warehouse::{DatasetRef, PartitionConfig, TableInfo, TableRef, Warehouse, WarehouseError};

pub mod diff;

pub use diff::{diff_columns, merge_columns, ChangeKind, ColumnChange, SchemaDiff};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("schema conflict on {table}: {}", .conflicts.join(", "))]
    SchemaConflict {
        table: String,
        conflicts: Vec<String>,
    },

    #[error("warehouse error while provisioning {table}: {source}")]
    Warehouse {
        table: String,
        #[source]
        source: WarehouseError,
    },
}

/// Table name decoration: `<prefix><stream><ext>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableNaming {
    pub prefix: Option<String>,
    pub ext: Option<String>,
}

impl TableNaming {
    /// Destination table name for `stream`. Characters the warehouse does
    /// not allow in table names become underscores.
    pub fn table_name(&self, stream: &str) -> String {
        let raw = format!(
            "{}{}{}",
            self.prefix.as_deref().unwrap_or(""),
            stream,
            self.ext.as_deref().unwrap_or("")
        );
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect()
    }
}

pub struct TableProvisioner {
    warehouse: Arc<dyn Warehouse>,
    dataset: DatasetRef,
    naming: TableNaming,
    call_timeout: Duration,
}

impl TableProvisioner {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        dataset: DatasetRef,
        naming: TableNaming,
        call_timeout: Duration,
    ) -> Self {
        Self {
            warehouse,
            dataset,
            naming,
            call_timeout,
        }
    }

    pub fn table_ref(&self, stream: &str) -> TableRef {
        self.dataset.table(self.naming.table_name(stream))
    }

    /// Create the destination dataset in `location` if it is missing.
    pub async fn ensure_dataset(&self, location: &str) -> Result<(), ProvisionError> {
        self.call(
            &self.dataset,
            self.warehouse.ensure_dataset(&self.dataset, location),
        )
        .await
    }

    /// Current destination table for `stream`, if any.
    pub async fn inspect(&self, stream: &str) -> Result<Option<TableInfo>, ProvisionError> {
        let table = self.table_ref(stream);
        self.call(&table, self.warehouse.get_table(&table)).await
    }

    /// Create the table for `stream` if absent, otherwise add whatever
    /// columns `schema` has that the table lacks.
    pub async fn ensure_table(
        &self,
        stream: &str,
        schema: &StreamSchema,
        partition: Option<&PartitionConfig>,
    ) -> Result<TableInfo, ProvisionError> {
        let table = self.table_ref(stream);

        if let Some(existing) = self.call(&table, self.warehouse.get_table(&table)).await? {
            if let Some(requested) = partition {
                if existing.partitioning.as_ref() != Some(requested) {
                    warn!(
                        table = %table,
                        column = %requested.column,
                        "partitioning can only be set when a table is created; ignoring"
                    );
                }
            }
            return self.evolve(existing, &schema.columns, false).await;
        }

        let partitioning = partition.and_then(|p| usable_partition(&table, p, &schema.columns));
        info!(
            table = %table,
            columns = schema.columns.len(),
            partitioned = partitioning.is_some(),
            "creating table"
        );

        let created = self
            .call(
                &table,
                self.warehouse
                    .create_table(&table, &schema.columns, partitioning.as_ref()),
            )
            .await;

        match created {
            Ok(info) => Ok(info),
            Err(ProvisionError::Warehouse {
                source: WarehouseError::AlreadyExists(_),
                ..
            }) => {
                // Lost a creation race; evolve whatever won.
                let existing = self
                    .call(&table, self.warehouse.get_table(&table))
                    .await?
                    .ok_or_else(|| ProvisionError::Warehouse {
                        table: table.to_string(),
                        source: WarehouseError::NotFound(table.to_string()),
                    })?;
                self.evolve(existing, &schema.columns, false).await
            }
            Err(e) => Err(e),
        }
    }

    /// Apply the additive part of the diff between `existing` and
    /// `desired`. Incompatible columns fail the call unless
    /// `allow_conflicts` is set, in which case they are skipped.
    pub async fn evolve(
        &self,
        existing: TableInfo,
        desired: &[Column],
        allow_conflicts: bool,
    ) -> Result<TableInfo, ProvisionError> {
        let diff = diff_columns(&existing.columns, desired);

        if diff.has_conflicts() {
            let conflicts: Vec<String> = diff.conflicts().map(describe_conflict).collect();
            if !allow_conflicts {
                return Err(ProvisionError::SchemaConflict {
                    table: existing.table.to_string(),
                    conflicts,
                });
            }
            warn!(table = %existing.table, ?conflicts, "skipping incompatible columns");
        }

        if !diff.has_applicable_changes() {
            return Ok(existing);
        }

        info!(
            table = %existing.table,
            changes = diff.changes.len(),
            "adding columns"
        );
        let merged = merge_columns(&existing.columns, desired);
        self.call(
            &existing.table,
            self.warehouse.update_columns(&existing.table, &merged),
        )
        .await
    }

    async fn call<T>(
        &self,
        target: &impl fmt::Display,
        fut: impl std::future::Future<Output = Result<T, WarehouseError>>,
    ) -> Result<T, ProvisionError> {
        let result = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(WarehouseError::Timeout(self.call_timeout)),
        };
        result.map_err(|source| ProvisionError::Warehouse {
            table: target.to_string(),
            source,
        })
    }
}

fn describe_conflict(change: &ColumnChange) -> String {
    match &change.kind {
        ChangeKind::Incompatible { existing, desired } => {
            format!("{} is {existing}, stream needs {desired}", change.column)
        }
        _ => change.column.clone(),
    }
}

/// Partitioning only applies to an existing timestamp column.
fn usable_partition(
    table: &TableRef,
    partition: &PartitionConfig,
    columns: &[Column],
) -> Option<PartitionConfig> {
    match columns.iter().find(|c| c.name == partition.column) {
        Some(column) if column.field_type == FieldType::Timestamp => Some(partition.clone()),
        Some(column) => {
            warn!(
                table = %table,
                column = %partition.column,
                field_type = %column.field_type,
                "partition column is not a timestamp; creating unpartitioned table"
            );
            None
        }
        None => {
            warn!(
                table = %table,
                column = %partition.column,
                "partition column not in schema; creating unpartitioned table"
            );
            None
        }
    }
}
