// Stream Schemas
//
// Column model for Singer streams: JSON-schema parsing, value type
// inference and the widening lattice every schema change goes through.

use std::fmt;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod registry;

pub use registry::{Declared, InvalidRecordPolicy, RegistryOptions, SchemaRegistry, Validated};

/// A single record payload, keyed by field name.
pub type Record = Map<String, Value>;

/// Field that receives the batch timestamp when a schema declares it.
pub const BATCH_TIMESTAMP: &str = "_sdc_batched_at";

/// Closed set of column types tracked per field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Object,
    Array,
}

impl FieldType {
    /// Least common supertype of two field types.
    ///
    /// Defined for every pair:
    /// - identical types are unchanged
    /// - integer and float meet at float
    /// - any other pair of distinct scalars meets at string
    /// - objects and arrays only meet themselves (`None` otherwise)
    pub fn widen(self, other: FieldType) -> Option<FieldType> {
        use FieldType::*;

        match (self, other) {
            (a, b) if a == b => Some(a),
            (Integer, Float) | (Float, Integer) => Some(Float),
            (Object, _) | (_, Object) | (Array, _) | (_, Array) => None,
            _ => Some(String),
        }
    }

    /// True when a value of type `other` fits a column of this type as is.
    pub fn accepts(self, other: FieldType) -> bool {
        self.widen(other) == Some(self)
    }

    pub fn is_scalar(self) -> bool {
        !matches!(self, FieldType::Object | FieldType::Array)
    }

    /// Infer the type of a JSON value. Null has no type.
    pub fn of_value(value: &Value) -> Option<FieldType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::Integer),
            Value::Number(_) => Some(FieldType::Float),
            Value::String(s) if DateTime::parse_from_rfc3339(s).is_ok() => {
                Some(FieldType::Timestamp)
            }
            Value::String(_) => Some(FieldType::String),
            Value::Array(_) => Some(FieldType::Array),
            Value::Object(_) => Some(FieldType::Object),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Timestamp => "timestamp",
            FieldType::Object => "object",
            FieldType::Array => "array",
        };
        f.write_str(name)
    }
}

/// Warehouse type names for the configurable numeric columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeNames {
    pub numeric: String,
    pub integer: String,
}

impl Default for TypeNames {
    fn default() -> Self {
        Self {
            numeric: "NUMERIC".into(),
            integer: "INT64".into(),
        }
    }
}

/// One destination column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default = "nullable_default")]
    pub nullable: bool,
    /// Nested columns of an object.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Column>,
    /// Element column of an array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Column>>,
}

fn nullable_default() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            fields: Vec::new(),
            items: None,
        }
    }

    /// Build a column from an observed, non-null value.
    pub fn infer(name: &str, value: &Value) -> Option<Column> {
        let field_type = FieldType::of_value(value)?;
        let mut column = Column::new(name, field_type);

        match value {
            Value::Object(map) => {
                column.fields = map
                    .iter()
                    .filter_map(|(key, nested)| Column::infer(key, nested))
                    .collect();
            }
            Value::Array(items) => {
                column.items = items
                    .iter()
                    .find_map(|item| Column::infer("item", item))
                    .map(Box::new);
            }
            _ => {}
        }

        Some(column)
    }

    /// Warehouse type name for this column.
    pub fn sql_type(&self, names: &TypeNames) -> String {
        match self.field_type {
            FieldType::String => "STRING".into(),
            FieldType::Integer => names.integer.clone(),
            FieldType::Float => names.numeric.clone(),
            FieldType::Boolean => "BOOL".into(),
            FieldType::Timestamp => "TIMESTAMP".into(),
            FieldType::Object => "RECORD".into(),
            FieldType::Array => match &self.items {
                Some(item) => format!("REPEATED {}", item.sql_type(names)),
                None => "REPEATED STRING".into(),
            },
        }
    }
}

/// Parse the `properties` of a JSON-schema object into columns.
pub fn parse_json_schema(schema: &Value) -> Result<Vec<Column>, String> {
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .ok_or_else(|| "schema has no `properties` object".to_string())?;

    Ok(properties
        .iter()
        .map(|(name, property)| parse_property(name, property))
        .collect())
}

fn parse_property(name: &str, property: &Value) -> Column {
    let mut property = property;
    let mut nullable = true;

    if property.get("type").is_none() {
        if let Some(alternatives) = property.get("anyOf").and_then(Value::as_array) {
            for alternative in alternatives {
                if alternative.get("type").and_then(Value::as_str) != Some("null") {
                    property = alternative;
                }
            }
        }
    }

    let type_name = match property.get("type") {
        Some(Value::String(name)) => Some(name.as_str()),
        Some(Value::Array(names)) => {
            let names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
            nullable = names.contains(&"null");
            names.into_iter().find(|name| *name != "null")
        }
        _ => None,
    };

    let field_type = match type_name {
        Some("integer") => FieldType::Integer,
        Some("number") => FieldType::Float,
        Some("boolean") => FieldType::Boolean,
        Some("object") => FieldType::Object,
        Some("array") => FieldType::Array,
        Some("string")
            if property.get("format").and_then(Value::as_str) == Some("date-time") =>
        {
            FieldType::Timestamp
        }
        _ => FieldType::String,
    };

    let mut column = Column::new(name, field_type);
    column.nullable = nullable;

    match field_type {
        FieldType::Object => {
            column.fields = parse_json_schema(property).unwrap_or_default();
        }
        FieldType::Array => {
            column.items = property
                .get("items")
                .map(|items| Box::new(parse_property("item", items)));
        }
        _ => {}
    }

    column
}

/// The schema currently in force for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSchema {
    pub stream: String,
    pub columns: Vec<Column>,
    pub key_properties: Vec<String>,
    /// Bumped on every declaration or widening.
    pub version: u64,
}

impl StreamSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Every column of `previous` is present here with a type that accepts it.
    pub fn is_superset_of(&self, previous: &StreamSchema) -> bool {
        previous.columns.iter().all(|old| {
            self.column(&old.name)
                .map(|new| new.field_type.accepts(old.field_type))
                .unwrap_or(false)
        })
    }

    /// Shape a record for the destination: scalars stored in string
    /// columns are stringified so widened columns load cleanly. Nested
    /// objects and arrays are shaped the same way.
    pub fn conform(&self, record: &Record) -> Record {
        conform_fields(&self.columns, record)
    }
}

fn conform_fields(columns: &[Column], record: &Record) -> Record {
    record
        .iter()
        .map(|(name, value)| {
            let value = match columns.iter().find(|c| &c.name == name) {
                Some(column) => conform_value(column, value),
                None => value.clone(),
            };
            (name.clone(), value)
        })
        .collect()
}

fn conform_value(column: &Column, value: &Value) -> Value {
    match (column.field_type, value) {
        (FieldType::String, Value::Number(n)) => Value::String(n.to_string()),
        (FieldType::String, Value::Bool(b)) => Value::String(b.to_string()),
        (FieldType::Object, Value::Object(map)) => Value::Object(conform_fields(&column.fields, map)),
        (FieldType::Array, Value::Array(items)) => match &column.items {
            Some(item) => Value::Array(items.iter().map(|v| conform_value(item, v)).collect()),
            None => value.clone(),
        },
        _ => value.clone(),
    }
}
