// Catalog Schema Sync
//
// Brings destination tables in line with a Singer catalog without
// reading any records: missing tables are created and missing or
// widenable columns applied. In dry-run mode only the plan is computed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::provision::{diff_columns, ProvisionError, SchemaDiff, TableProvisioner};
use crate::schema::{parse_json_schema, Column, TypeNames};
use crate::warehouse::{PartitionConfig, TableRef};

/// A Singer catalog, as written by a tap in discovery mode.
#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    pub streams: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub tap_stream_id: Option<String>,
    pub schema: Value,
    #[serde(default)]
    pub key_properties: Vec<String>,
}

impl CatalogEntry {
    pub fn name(&self) -> Option<&str> {
        self.stream.as_deref().or(self.tap_stream_id.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Only these streams, when set.
    pub tables: Option<Vec<String>>,
    pub dry_run: bool,
    pub continue_on_incompatible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableAction {
    Create,
    Update,
    Unchanged,
    /// Left alone because of incompatible columns.
    Skipped,
}

/// Column as it would be declared in the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedColumn {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TablePlan {
    pub stream: String,
    pub table: String,
    pub action: TableAction,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<PlannedColumn>,
    #[serde(skip_serializing_if = "SchemaDiff::is_clean")]
    pub diff: SchemaDiff,
    pub applied: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub dry_run: bool,
    pub tables: Vec<TablePlan>,
}

impl SyncPlan {
    pub fn has_conflicts(&self) -> bool {
        self.tables.iter().any(|t| t.diff.has_conflicts())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("catalog stream #{index} has neither `stream` nor `tap_stream_id`")]
    UnnamedStream { index: usize },

    #[error("catalog stream `{stream}` has an invalid schema: {reason}")]
    InvalidSchema { stream: String, reason: String },

    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

/// Plan, and unless `dry_run` apply, table changes for every selected
/// catalog stream.
pub async fn sync_catalog(
    provisioner: &TableProvisioner,
    catalog: &Catalog,
    partition: Option<&PartitionConfig>,
    type_names: &TypeNames,
    options: &SyncOptions,
) -> Result<SyncPlan, SyncError> {
    let mut plan = SyncPlan {
        dry_run: options.dry_run,
        tables: Vec::new(),
    };

    for (index, entry) in catalog.streams.iter().enumerate() {
        let stream = entry.name().ok_or(SyncError::UnnamedStream { index })?;
        if let Some(selected) = &options.tables {
            if !selected.iter().any(|t| t == stream) {
                continue;
            }
        }

        let columns = parse_json_schema(&entry.schema).map_err(|reason| {
            SyncError::InvalidSchema {
                stream: stream.to_string(),
                reason,
            }
        })?;
        let table = provisioner.table_ref(stream);
        let table_plan = sync_table(
            provisioner,
            stream,
            &table,
            &columns,
            &entry.key_properties,
            partition,
            type_names,
            options,
        )
        .await?;

        info!(
            stream,
            table = %table,
            action = ?table_plan.action,
            applied = table_plan.applied,
            "schema sync"
        );
        plan.tables.push(table_plan);
    }

    Ok(plan)
}

#[allow(clippy::too_many_arguments)]
async fn sync_table(
    provisioner: &TableProvisioner,
    stream: &str,
    table: &TableRef,
    columns: &[Column],
    key_properties: &[String],
    partition: Option<&PartitionConfig>,
    type_names: &TypeNames,
    options: &SyncOptions,
) -> Result<TablePlan, SyncError> {
    let planned = |cols: &[Column]| -> Vec<PlannedColumn> {
        cols.iter()
            .map(|c| PlannedColumn {
                name: c.name.clone(),
                sql_type: c.sql_type(type_names),
                nullable: c.nullable,
            })
            .collect()
    };

    let Some(existing) = provisioner.inspect(stream).await? else {
        let mut plan = TablePlan {
            stream: stream.to_string(),
            table: table.to_string(),
            action: TableAction::Create,
            columns: planned(columns),
            diff: diff_columns(&[], columns),
            applied: false,
        };
        if !options.dry_run {
            let schema = crate::schema::StreamSchema {
                stream: stream.to_string(),
                columns: columns.to_vec(),
                key_properties: key_properties.to_vec(),
                version: 1,
            };
            provisioner.ensure_table(stream, &schema, partition).await?;
            plan.applied = true;
        }
        return Ok(plan);
    };

    let diff = diff_columns(&existing.columns, columns);
    let action = if diff.has_conflicts() {
        if !options.continue_on_incompatible {
            return Err(ProvisionError::SchemaConflict {
                table: table.to_string(),
                conflicts: diff.conflicts().map(|c| c.column.clone()).collect(),
            }
            .into());
        }
        warn!(stream, table = %table, "incompatible columns; table left as is");
        if diff.has_applicable_changes() {
            TableAction::Update
        } else {
            TableAction::Skipped
        }
    } else if diff.is_clean() {
        TableAction::Unchanged
    } else {
        TableAction::Update
    };

    let mut plan = TablePlan {
        stream: stream.to_string(),
        table: table.to_string(),
        action,
        columns: Vec::new(),
        diff,
        applied: false,
    };
    if action == TableAction::Update && !options.dry_run {
        let updated = provisioner
            .evolve(existing, columns, options.continue_on_incompatible)
            .await?;
        plan.columns = planned(&updated.columns);
        plan.applied = true;
    }
    Ok(plan)
}
