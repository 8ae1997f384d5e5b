// Column Diff
//
// Compares the columns a table has with the columns a stream needs and
// classifies every difference. Only additive changes are ever applied:
// existing columns are never dropped or narrowed.

use serde::Serialize;

use crate::schema::{Column, FieldType};

/// Kind of difference found for one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Column is missing from the table.
    Added { field_type: FieldType },

    /// Existing column type is widened to a supertype.
    Widened { from: FieldType, to: FieldType },

    /// No common supertype: the change cannot be applied.
    Incompatible {
        existing: FieldType,
        desired: FieldType,
    },
}

/// A single column finding. Nested columns use dotted paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnChange {
    pub column: String,
    #[serde(flatten)]
    pub kind: ChangeKind,
}

/// Full diff between existing and desired columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaDiff {
    pub changes: Vec<ColumnChange>,
}

impl SchemaDiff {
    pub fn is_clean(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn has_conflicts(&self) -> bool {
        self.conflicts().next().is_some()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &ColumnChange> {
        self.changes
            .iter()
            .filter(|c| matches!(c.kind, ChangeKind::Incompatible { .. }))
    }

    /// True when applying the diff would change the table.
    pub fn has_applicable_changes(&self) -> bool {
        self.changes
            .iter()
            .any(|c| !matches!(c.kind, ChangeKind::Incompatible { .. }))
    }
}

/// Diff `existing` table columns against `desired` stream columns.
pub fn diff_columns(existing: &[Column], desired: &[Column]) -> SchemaDiff {
    let mut changes = Vec::new();
    diff_into(existing, desired, "", &mut changes);
    SchemaDiff { changes }
}

fn diff_into(existing: &[Column], desired: &[Column], prefix: &str, out: &mut Vec<ColumnChange>) {
    for want in desired {
        let path = format!("{prefix}{}", want.name);

        let Some(have) = existing.iter().find(|c| c.name == want.name) else {
            out.push(ColumnChange {
                column: path,
                kind: ChangeKind::Added {
                    field_type: want.field_type,
                },
            });
            continue;
        };

        match have.field_type.widen(want.field_type) {
            None => out.push(ColumnChange {
                column: path,
                kind: ChangeKind::Incompatible {
                    existing: have.field_type,
                    desired: want.field_type,
                },
            }),
            Some(joined) if joined != have.field_type => out.push(ColumnChange {
                column: path,
                kind: ChangeKind::Widened {
                    from: have.field_type,
                    to: joined,
                },
            }),
            Some(FieldType::Object) => {
                diff_into(&have.fields, &want.fields, &format!("{path}."), out);
            }
            Some(FieldType::Array) => {
                if let (Some(have), Some(want)) = (object_items(have), object_items(want)) {
                    diff_into(&have.fields, &want.fields, &format!("{path}[]."), out);
                }
            }
            Some(_) => {}
        }
    }
}

/// Element column of an array of objects.
fn object_items(column: &Column) -> Option<&Column> {
    column
        .items
        .as_deref()
        .filter(|item| item.field_type == FieldType::Object)
}

/// Merge `desired` into `existing`, applying every non-conflicting change.
///
/// Existing columns keep their position, nullability and any type the
/// diff does not widen. New columns are appended as nullable.
pub fn merge_columns(existing: &[Column], desired: &[Column]) -> Vec<Column> {
    let mut merged: Vec<Column> = existing.to_vec();

    for want in desired {
        match merged.iter_mut().find(|c| c.name == want.name) {
            None => {
                let mut added = want.clone();
                added.nullable = true;
                merged.push(added);
            }
            Some(have) => match have.field_type.widen(want.field_type) {
                Some(FieldType::Object) => {
                    have.fields = merge_columns(&have.fields, &want.fields);
                }
                Some(FieldType::Array) => {
                    if let (Some(item), Some(want)) = (have.items.as_deref_mut(), object_items(want)) {
                        if item.field_type == FieldType::Object {
                            item.fields = merge_columns(&item.fields, &want.fields);
                        }
                    }
                }
                Some(joined) => have.field_type = joined,
                None => {}
            },
        }
    }

    merged
}
