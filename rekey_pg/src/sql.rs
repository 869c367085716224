//! SQL text helpers and conversions between Postgres and core values.

use rekey_core::prelude::*;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row, TypeInfo, ValueRef};
use uuid::Uuid;

/// Quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A schema-qualified, quoted table name.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Name of the unique index backing a shadow column.
pub fn index_name(table: &str, column: &str) -> String {
    format!("rekey_{}_{}_key", table, column)
}

/// Name of a foreign key constraint added after the swap.
pub fn foreign_key_name(table: &str, column: &str) -> String {
    format!("rekey_{}_{}_fkey", table, column)
}

/// The Postgres type used for a column type.
pub fn sql_type(column_type: &ColumnType) -> String {
    match column_type {
        ColumnType::Integer => "INTEGER".to_string(),
        ColumnType::BigInt => "BIGINT".to_string(),
        ColumnType::Uuid => "UUID".to_string(),
        ColumnType::Text => "TEXT".to_string(),
        ColumnType::Timestamp => "TIMESTAMPTZ".to_string(),
        ColumnType::Boolean => "BOOLEAN".to_string(),
        ColumnType::Other(name) => name.clone(),
    }
}

/// Maps an `information_schema.columns.data_type` value.
pub fn column_type(data_type: &str) -> ColumnType {
    match data_type {
        "integer" | "smallint" => ColumnType::Integer,
        "bigint" => ColumnType::BigInt,
        "uuid" => ColumnType::Uuid,
        "text" | "character varying" => ColumnType::Text,
        "timestamp with time zone" => ColumnType::Timestamp,
        "boolean" => ColumnType::Boolean,
        other => ColumnType::Other(other.to_string()),
    }
}

/// Renders a value as a SQL literal for DDL defaults.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Int(v) => v.to_string(),
        Value::Uuid(v) => format!("'{}'::uuid", v),
        Value::Text(v) => format!("'{}'", v.replace('\'', "''")),
        Value::Timestamp(v) => format!("'{}'::timestamptz", v.to_rfc3339()),
        Value::Bool(v) => v.to_string(),
    }
}

/// Binds a single non-array value.
pub fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value.clone() {
        Value::Null => query.bind(None::<String>),
        Value::Int(v) => query.bind(v),
        Value::Uuid(v) => query.bind(v),
        Value::Text(v) => query.bind(v),
        Value::Timestamp(v) => query.bind(v),
        Value::Bool(v) => query.bind(v),
    }
}

/// Decodes column `index` of `row` by its reported type.
pub fn decode_value(row: &PgRow, index: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    Ok(match type_name.as_str() {
        "INT2" => Value::Int(i64::from(row.try_get::<i16, _>(index)?)),
        "INT4" => Value::Int(i64::from(row.try_get::<i32, _>(index)?)),
        "INT8" => Value::Int(row.try_get::<i64, _>(index)?),
        "UUID" => Value::Uuid(row.try_get::<Uuid, _>(index)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Value::Text(row.try_get::<String, _>(index)?),
        "TIMESTAMPTZ" => Value::Timestamp(row.try_get(index)?),
        "BOOL" => Value::Bool(row.try_get::<bool, _>(index)?),
        other => {
            return Err(sqlx::Error::Decode(
                format!("unsupported column type {}", other).into(),
            ));
        }
    })
}

/// Keys of one type, bound as a single Postgres array.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyArray {
    /// Integer keys.
    Int(Vec<i64>),
    /// UUID keys.
    Uuid(Vec<Uuid>),
    /// Text keys.
    Text(Vec<String>),
}

impl KeyArray {
    /// Collects `keys`, which must all be of the same supported type.
    pub fn new<'a>(keys: impl IntoIterator<Item = &'a Value>) -> Result<Self, StorageError> {
        let mut keys = keys.into_iter();
        let Some(first) = keys.next() else {
            return Ok(KeyArray::Int(Vec::new()));
        };
        let mut array = match first {
            Value::Int(v) => KeyArray::Int(vec![*v]),
            Value::Uuid(v) => KeyArray::Uuid(vec![*v]),
            Value::Text(v) => KeyArray::Text(vec![v.clone()]),
            other => return Err(unsupported_key(other)),
        };
        for key in keys {
            match (&mut array, key) {
                (KeyArray::Int(keys), Value::Int(v)) => keys.push(*v),
                (KeyArray::Uuid(keys), Value::Uuid(v)) => keys.push(*v),
                (KeyArray::Text(keys), Value::Text(v)) => keys.push(v.clone()),
                (_, other) => return Err(unsupported_key(other)),
            }
        }
        Ok(array)
    }

    /// The array type to cast the bound parameter to.
    pub fn sql_type(&self) -> &'static str {
        match self {
            KeyArray::Int(_) => "BIGINT[]",
            KeyArray::Uuid(_) => "UUID[]",
            KeyArray::Text(_) => "TEXT[]",
        }
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        match self {
            KeyArray::Int(keys) => keys.len(),
            KeyArray::Uuid(keys) => keys.len(),
            KeyArray::Text(keys) => keys.len(),
        }
    }

    /// Whether there are no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Binds the array.
    pub fn bind<'q>(
        self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            KeyArray::Int(keys) => query.bind(keys),
            KeyArray::Uuid(keys) => query.bind(keys),
            KeyArray::Text(keys) => query.bind(keys),
        }
    }
}

fn unsupported_key(key: &Value) -> StorageError {
    StorageError::Unexpected(format!("key {} cannot be used in a key batch", key))
}
