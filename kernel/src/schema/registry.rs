// Schema Registry
//
// Latest known schema per stream. Records are checked against it and,
// outside strict mode, the schema is widened in place so nothing is
// buffered with fields the registry does not know about.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::{debug, warn};

use super::{parse_json_schema, Column, FieldType, Record, StreamSchema, BATCH_TIMESTAMP};

/// Invalid records logged individually before the log goes quiet.
const MAX_WARNINGS: u64 = 20;

/// What to do with a record that cannot be made to fit its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidRecordPolicy {
    #[default]
    Abort,
    Skip,
    Force,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryOptions {
    /// Reject unknown fields and widenings instead of inferring.
    pub strict: bool,
    pub on_invalid: InvalidRecordPolicy,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("record for stream `{stream}` arrived before its schema")]
    UnknownStream { stream: String },

    #[error("stream `{stream}`: field `{field}` is not declared in the schema")]
    UnknownField { stream: String, field: String },

    #[error("stream `{stream}`: field `{field}` is {expected} but the record holds {found}")]
    IncompatibleType {
        stream: String,
        field: String,
        expected: FieldType,
        found: FieldType,
    },

    #[error("stream `{stream}`: field `{field}` would widen from {from} to {to} in strict mode")]
    WideningRejected {
        stream: String,
        field: String,
        from: FieldType,
        to: FieldType,
    },

    #[error("invalid schema for stream `{stream}`: {reason}")]
    InvalidSchema { stream: String, reason: String },
}

/// Outcome of a schema declaration.
#[derive(Debug, Clone)]
pub struct Declared {
    pub schema: Arc<StreamSchema>,
    /// Records buffered under the previous schema must be flushed first.
    pub flush_first: bool,
}

/// Outcome of record validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    Accepted {
        record: Record,
        /// Set when the record widened the stream schema.
        widened: Option<Arc<StreamSchema>>,
    },
    /// Dropped under [`InvalidRecordPolicy::Skip`].
    Skipped,
}

#[derive(Debug)]
struct Entry {
    schema: Arc<StreamSchema>,
    invalid_records: u64,
}

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    options: RegistryOptions,
    streams: HashMap<String, Entry>,
}

impl SchemaRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            options,
            streams: HashMap::new(),
        }
    }

    /// Replace the schema for `stream`.
    pub fn declare_schema(
        &mut self,
        stream: &str,
        schema: &Value,
        key_properties: Vec<String>,
    ) -> Result<Declared, SchemaError> {
        let columns = parse_json_schema(schema).map_err(|reason| SchemaError::InvalidSchema {
            stream: stream.to_string(),
            reason,
        })?;

        let previous = self.streams.get(stream).map(|e| Arc::clone(&e.schema));
        let next = StreamSchema {
            stream: stream.to_string(),
            columns,
            key_properties,
            version: previous.as_ref().map(|p| p.version + 1).unwrap_or(1),
        };
        let flush_first = previous
            .as_ref()
            .map(|p| !next.is_superset_of(p))
            .unwrap_or(false);

        debug!(
            stream,
            version = next.version,
            columns = next.columns.len(),
            flush_first,
            "schema declared"
        );

        let schema = Arc::new(next);
        let entry = self.streams.entry(stream.to_string()).or_insert_with(|| Entry {
            schema: Arc::clone(&schema),
            invalid_records: 0,
        });
        entry.schema = Arc::clone(&schema);

        Ok(Declared {
            schema,
            flush_first,
        })
    }

    /// Check a record against the stored schema, widening it when allowed.
    ///
    /// Nested objects are checked against their column's `fields`; an
    /// object column declared without properties takes any shape.
    pub fn validate(&mut self, stream: &str, record: Record) -> Result<Validated, SchemaError> {
        let entry = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| SchemaError::UnknownStream {
                stream: stream.to_string(),
            })?;

        let mut checker = Checker {
            stream,
            options: self.options,
            invalid: Vec::new(),
        };
        let (mut accepted, columns) = checker.check_object(&entry.schema.columns, record, "")?;
        let mut invalid = checker.invalid;

        if !invalid.is_empty() {
            entry.invalid_records += 1;
            if entry.invalid_records <= MAX_WARNINGS {
                warn!(
                    stream,
                    invalid_records = entry.invalid_records,
                    error = %invalid[0],
                    "record failed validation"
                );
            } else if entry.invalid_records == MAX_WARNINGS + 1 {
                warn!(stream, "max validation warnings reached");
            }

            match self.options.on_invalid {
                InvalidRecordPolicy::Abort => return Err(invalid.remove(0)),
                InvalidRecordPolicy::Skip => return Ok(Validated::Skipped),
                // Offending values were already replaced with null.
                InvalidRecordPolicy::Force => {}
            }
        }

        let widened = columns.map(|columns| {
            let schema = Arc::new(StreamSchema {
                stream: stream.to_string(),
                columns,
                key_properties: entry.schema.key_properties.clone(),
                version: entry.schema.version + 1,
            });
            debug!(stream, version = schema.version, "schema widened by record");
            entry.schema = Arc::clone(&schema);
            schema
        });

        if entry.schema.column(BATCH_TIMESTAMP).is_some() {
            accepted.insert(
                BATCH_TIMESTAMP.to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }

        Ok(Validated::Accepted {
            record: accepted,
            widened,
        })
    }

    /// Ordered primary-key fields; empty means append-only writes.
    pub fn key_properties(&self, stream: &str) -> &[String] {
        self.streams
            .get(stream)
            .map(|e| e.schema.key_properties.as_slice())
            .unwrap_or(&[])
    }

    pub fn schema(&self, stream: &str) -> Option<&Arc<StreamSchema>> {
        self.streams.get(stream).map(|e| &e.schema)
    }

    pub fn invalid_records(&self, stream: &str) -> u64 {
        self.streams
            .get(stream)
            .map(|e| e.invalid_records)
            .unwrap_or(0)
    }
}

/// One validation pass over a record and its nested values.
struct Checker<'a> {
    stream: &'a str,
    options: RegistryOptions,
    invalid: Vec<SchemaError>,
}

impl Checker<'_> {
    /// Check `record` against `columns`. Returns the accepted record and,
    /// when anything was added or widened, the new column list. Nested
    /// fields are reported under dotted paths.
    fn check_object(
        &mut self,
        columns: &[Column],
        record: Record,
        path: &str,
    ) -> Result<(Record, Option<Vec<Column>>), SchemaError> {
        let mut widened: Option<Vec<Column>> = None;
        let mut accepted = Record::new();

        for (field, value) in record {
            let field_path = if path.is_empty() {
                field.clone()
            } else {
                format!("{path}.{field}")
            };
            let current = widened.as_deref().unwrap_or(columns);

            let Some(position) = current.iter().position(|c| c.name == field) else {
                if value.is_null() {
                    continue;
                }
                if self.options.strict {
                    return Err(SchemaError::UnknownField {
                        stream: self.stream.to_string(),
                        field: field_path,
                    });
                }
                if let Some(column) = Column::infer(&field, &value) {
                    widened.get_or_insert_with(|| columns.to_vec()).push(column);
                }
                accepted.insert(field, value);
                continue;
            };

            let (value, column) = self.check_value(&current[position], value, &field_path)?;
            if let Some(column) = column {
                widened.get_or_insert_with(|| columns.to_vec())[position] = column;
            }
            accepted.insert(field, value);
        }

        Ok((accepted, widened))
    }

    fn check_value(
        &mut self,
        column: &Column,
        value: Value,
        path: &str,
    ) -> Result<(Value, Option<Column>), SchemaError> {
        let declared = column.field_type;
        let value = coerce_numeric_string(declared, value);

        let Some(found) = FieldType::of_value(&value) else {
            return Ok((value, None));
        };

        match declared.widen(found) {
            Some(joined) if joined == declared => match value {
                Value::Object(map) if !column.fields.is_empty() => {
                    let (map, fields) = self.check_object(&column.fields, map, path)?;
                    let widened = fields.map(|fields| Column {
                        fields,
                        ..column.clone()
                    });
                    Ok((Value::Object(map), widened))
                }
                Value::Array(items) => self.check_items(column, items, path),
                value => Ok((value, None)),
            },
            Some(joined) => {
                if self.options.strict {
                    return Err(SchemaError::WideningRejected {
                        stream: self.stream.to_string(),
                        field: path.to_string(),
                        from: declared,
                        to: joined,
                    });
                }
                let mut column = column.clone();
                column.field_type = joined;
                Ok((value, Some(column)))
            }
            None => {
                self.invalid.push(SchemaError::IncompatibleType {
                    stream: self.stream.to_string(),
                    field: path.to_string(),
                    expected: declared,
                    found,
                });
                let value = match self.options.on_invalid {
                    InvalidRecordPolicy::Force => Value::Null,
                    _ => value,
                };
                Ok((value, None))
            }
        }
    }

    /// Object elements of an array whose items are typed objects.
    fn check_items(
        &mut self,
        column: &Column,
        items: Vec<Value>,
        path: &str,
    ) -> Result<(Value, Option<Column>), SchemaError> {
        let Some(item) = column
            .items
            .as_deref()
            .filter(|item| item.field_type == FieldType::Object && !item.fields.is_empty())
        else {
            return Ok((Value::Array(items), None));
        };

        let mut item = item.clone();
        let mut changed = false;
        let item_path = format!("{path}[]");
        let mut checked = Vec::with_capacity(items.len());

        for element in items {
            match element {
                Value::Object(map) => {
                    let (map, fields) = self.check_object(&item.fields, map, &item_path)?;
                    if let Some(fields) = fields {
                        item.fields = fields;
                        changed = true;
                    }
                    checked.push(Value::Object(map));
                }
                other => checked.push(other),
            }
        }

        let widened = changed.then(|| Column {
            items: Some(Box::new(item)),
            ..column.clone()
        });
        Ok((Value::Array(checked), widened))
    }
}

/// Strings holding numbers are accepted by numeric columns.
fn coerce_numeric_string(declared: FieldType, value: Value) -> Value {
    let Value::String(text) = &value else {
        return value;
    };
    if !matches!(declared, FieldType::Integer | FieldType::Float) {
        return value;
    }

    let text = text.trim();
    if declared == FieldType::Integer {
        if let Ok(n) = text.parse::<i64>() {
            return Value::Number(n.into());
        }
    }
    match text.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(n) => Value::Number(n),
        None => value,
    }
}
