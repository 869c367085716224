//! Column and cell types shared between the engine and storage backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The column types the engine knows how to reason about.
///
/// Storage engines map these onto their native types; anything an engine
/// reports that doesn't fit is surfaced as [`ColumnType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    BigInt,
    /// 128-bit UUID.
    Uuid,
    /// Variable length text.
    Text,
    /// Timestamp with time zone.
    Timestamp,
    /// Boolean.
    Boolean,
    /// An engine-native type the engine can carry but not interpret.
    Other(String),
}

impl ColumnType {
    /// Returns `true` when a [`Value`] of this type can be used as a row key.
    pub fn is_key_type(&self) -> bool {
        matches!(
            self,
            ColumnType::Integer | ColumnType::BigInt | ColumnType::Uuid | ColumnType::Text
        )
    }

    /// Returns `true` if `value` is a valid (non-null) instance of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Integer, Value::Int(v)) => i32::try_from(*v).is_ok(),
            (ColumnType::BigInt, Value::Int(_)) => true,
            (ColumnType::Uuid, Value::Uuid(_)) => true,
            (ColumnType::Text, Value::Text(_)) => true,
            (ColumnType::Timestamp, Value::Timestamp(_)) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Other(_), _) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::BigInt => write!(f, "bigint"),
            ColumnType::Uuid => write!(f, "uuid"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Timestamp => write!(f, "timestamptz"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Other(name) => write!(f, "{}", name),
        }
    }
}

/// A single cell value.
///
/// Values are ordered first by variant and then by content, which gives
/// row keys of the same column a stable total order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Any integer column.
    Int(i64),
    /// A UUID.
    Uuid(Uuid),
    /// Text.
    Text(String),
    /// A UTC timestamp.
    Timestamp(DateTime<Utc>),
    /// A boolean.
    Bool(bool),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the UUID if this is a [`Value::Uuid`].
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns the timestamp if this is a [`Value::Timestamp`].
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Uuid(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{:?}", v),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Describes a column, either one that exists or one to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub column_type: ColumnType,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Whether a single-column unique constraint (or primary key) covers it.
    #[serde(default)]
    pub unique: bool,
    /// Literal default applied to new rows.
    #[serde(default)]
    pub default: Option<Value>,
}

impl ColumnDef {
    /// Creates a nullable, non-unique column definition.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            unique: false,
            default: None,
        }
    }

    /// Marks the column `NOT NULL`.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Marks the column unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets a literal default.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// A relation as reported by a storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTable {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Primary key column, if the table has a single-column primary key.
    pub identity_column: Option<String>,
}

impl TargetTable {
    /// Looks a column up by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns `true` if the table has a column named `name`.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_rejects_values_out_of_range() {
        assert!(ColumnType::Integer.accepts(&Value::Int(42)));
        assert!(!ColumnType::Integer.accepts(&Value::Int(i64::from(i32::MAX) + 1)));
        assert!(ColumnType::BigInt.accepts(&Value::Int(i64::MAX)));
    }

    #[test]
    fn null_is_accepted_by_every_type() {
        for ty in [ColumnType::Uuid, ColumnType::Text, ColumnType::Boolean] {
            assert!(ty.accepts(&Value::Null));
        }
    }

    #[test]
    fn values_of_one_variant_sort_by_content() {
        let mut keys = vec![Value::Int(10), Value::Int(2), Value::Int(7)];
        keys.sort();
        assert_eq!(keys, vec![Value::Int(2), Value::Int(7), Value::Int(10)]);
    }

    #[test]
    fn option_converts_to_null() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some(3i64)), Value::Int(3));
    }
}
