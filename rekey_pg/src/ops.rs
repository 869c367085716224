//! Statements shared by [`PgEngine`](crate::PgEngine) and the swap boundary.
//!
//! Every function runs on a plain connection, so the same code serves
//! autocommit calls on the pool and calls inside the swap transaction.

use crate::error::storage_error;
use crate::sql::{
    KeyArray, decode_value, foreign_key_name, index_name, literal, qualified, quote_ident,
    sql_type,
};
use rekey_core::prelude::*;
use sqlx::{PgConnection, Row};
use std::collections::HashMap;
use uuid::Uuid;

async fn execute(
    conn: &mut PgConnection,
    sql: &str,
    table: &str,
    column: &str,
) -> Result<(), StorageError> {
    log::debug!("{}", sql);
    sqlx::query(sql)
        .execute(conn)
        .await
        .map_err(|e| storage_error(e, table, column))?;
    Ok(())
}

async fn count(
    conn: &mut PgConnection,
    sql: &str,
    table: &str,
    column: &str,
) -> Result<u64, StorageError> {
    let count: i64 = sqlx::query_scalar(sql)
        .fetch_one(conn)
        .await
        .map_err(|e| storage_error(e, table, column))?;
    Ok(count.max(0) as u64)
}

pub(crate) async fn describe_table(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
) -> Result<TargetTable, StorageError> {
    let rows = sqlx::query(
        r#"
        SELECT column_name, data_type, is_nullable
        FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2
        ORDER BY ordinal_position
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| storage_error(e, table, ""))?;
    if rows.is_empty() {
        return Err(StorageError::UnknownTable(table.to_string()));
    }

    let indexed = sqlx::query(
        r#"
        SELECT a.attname::TEXT AS column_name, i.indisprimary AS is_primary
        FROM pg_index i
        JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = i.indkey[0]
        WHERE i.indrelid = to_regclass($1) AND i.indisunique AND i.indnatts = 1
        "#,
    )
    .bind(qualified(schema, table))
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| storage_error(e, table, ""))?;

    let mut unique: HashMap<String, bool> = HashMap::new();
    for row in &indexed {
        let name: String = row.get("column_name");
        let primary: bool = row.get("is_primary");
        *unique.entry(name).or_default() |= primary;
    }

    let columns = rows
        .iter()
        .map(|row| {
            let name: String = row.get("column_name");
            let data_type: String = row.get("data_type");
            let nullable: String = row.get("is_nullable");
            ColumnDef {
                unique: unique.contains_key(&name),
                column_type: crate::sql::column_type(&data_type),
                nullable: nullable == "YES",
                default: None,
                name,
            }
        })
        .collect();
    let identity_column = unique
        .iter()
        .find(|(_, primary)| **primary)
        .map(|(name, _)| name.clone());

    Ok(TargetTable {
        name: table.to_string(),
        columns,
        identity_column,
    })
}

pub(crate) async fn add_column(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    column: &ColumnDef,
) -> Result<(), StorageError> {
    let mut sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        qualified(schema, table),
        quote_ident(&column.name),
        sql_type(&column.column_type)
    );
    if let Some(default) = &column.default {
        sql.push_str(&format!(" DEFAULT {}", literal(default)));
    }
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if column.unique {
        sql.push_str(" UNIQUE");
    }
    execute(conn, &sql, table, &column.name).await
}

pub(crate) async fn drop_column(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<(), StorageError> {
    let sql = format!(
        "ALTER TABLE {} DROP COLUMN {}",
        qualified(schema, table),
        quote_ident(column)
    );
    execute(conn, &sql, table, column).await
}

pub(crate) async fn rename_column(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    from: &str,
    to: &str,
) -> Result<(), StorageError> {
    let sql = format!(
        "ALTER TABLE {} RENAME COLUMN {} TO {}",
        qualified(schema, table),
        quote_ident(from),
        quote_ident(to)
    );
    execute(conn, &sql, table, from).await
}

/// `concurrently` avoids blocking writers but cannot run in a transaction.
pub(crate) async fn add_unique_index(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    column: &str,
    concurrently: bool,
) -> Result<(), StorageError> {
    let sql = format!(
        "CREATE UNIQUE INDEX {}{} ON {} ({})",
        if concurrently { "CONCURRENTLY " } else { "" },
        quote_ident(&index_name(table, column)),
        qualified(schema, table),
        quote_ident(column)
    );
    execute(conn, &sql, table, column).await
}

/// Removes the invalid index a failed concurrent build leaves behind.
pub(crate) async fn drop_leftover_index(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<(), StorageError> {
    let sql = format!(
        "DROP INDEX CONCURRENTLY IF EXISTS {}",
        qualified(schema, &index_name(table, column))
    );
    execute(conn, &sql, table, column).await
}

pub(crate) async fn drop_index(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<(), StorageError> {
    let sql = format!(
        "DROP INDEX {}",
        qualified(schema, &index_name(table, column))
    );
    execute(conn, &sql, table, column).await
}

pub(crate) async fn add_primary_key(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<(), StorageError> {
    let sql = format!(
        "ALTER TABLE {} ADD PRIMARY KEY ({})",
        qualified(schema, table),
        quote_ident(column)
    );
    execute(conn, &sql, table, column).await
}

pub(crate) async fn add_foreign_key(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    column: &str,
    ref_table: &str,
    ref_column: &str,
) -> Result<(), StorageError> {
    let sql = format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
        qualified(schema, table),
        quote_ident(&foreign_key_name(table, column)),
        quote_ident(column),
        qualified(schema, ref_table),
        quote_ident(ref_column)
    );
    execute(conn, &sql, table, column).await
}

pub(crate) async fn set_not_null(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<(), StorageError> {
    let sql = format!(
        "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
        qualified(schema, table),
        quote_ident(column)
    );
    execute(conn, &sql, table, column).await
}

pub(crate) async fn fetch_pending(
    conn: &mut PgConnection,
    schema: &str,
    query: &PendingQuery<'_>,
) -> Result<Vec<PendingRow>, StorageError> {
    let key = quote_ident(query.key_column);
    let source = query
        .source_column
        .map(quote_ident)
        .unwrap_or_else(|| "NULL".to_string());

    let mut sql = format!(
        "SELECT {key}, {source} FROM {} WHERE {} IS NULL",
        qualified(schema, query.table),
        quote_ident(query.shadow_column)
    );
    if query.require_source {
        sql.push_str(&format!(" AND {source} IS NOT NULL"));
    }
    if query.after.is_some() {
        sql.push_str(&format!(" AND {key} > $1"));
    }
    sql.push_str(&format!(" ORDER BY {key} LIMIT {}", query.limit));

    let mut statement = sqlx::query(&sql);
    if let Some(after) = query.after {
        statement = crate::sql::bind_value(statement, after);
    }
    let rows = statement
        .fetch_all(conn)
        .await
        .map_err(|e| storage_error(e, query.table, query.shadow_column))?;

    rows.iter()
        .map(|row| {
            Ok(PendingRow {
                key: decode_value(row, 0)?,
                source: decode_value(row, 1)?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(|e| storage_error(e, query.table, query.key_column))
}

pub(crate) async fn lookup_shadow(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    key_column: &str,
    shadow_column: &str,
    keys: &[Value],
) -> Result<HashMap<Value, Uuid>, StorageError> {
    let keys = KeyArray::new(keys)?;
    if keys.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT {key}, {shadow} FROM {} WHERE {key} = ANY($1::{}) AND {shadow} IS NOT NULL",
        qualified(schema, table),
        keys.sql_type(),
        key = quote_ident(key_column),
        shadow = quote_ident(shadow_column),
    );
    let rows = keys
        .bind(sqlx::query(&sql))
        .fetch_all(conn)
        .await
        .map_err(|e| storage_error(e, table, shadow_column))?;

    rows.iter()
        .map(|row| Ok((decode_value(row, 0)?, row.try_get::<Uuid, _>(1)?)))
        .collect::<Result<HashMap<_, _>, sqlx::Error>>()
        .map_err(|e| storage_error(e, table, shadow_column))
}

/// One statement, so the batch commits or fails as a whole.
pub(crate) async fn write_shadow(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    key_column: &str,
    shadow_column: &str,
    updates: &[(Value, Uuid)],
) -> Result<u64, StorageError> {
    if updates.is_empty() {
        return Ok(0);
    }
    let keys = KeyArray::new(updates.iter().map(|(key, _)| key))?;
    let ids: Vec<Uuid> = updates.iter().map(|(_, id)| *id).collect();
    let sql = format!(
        r#"
        UPDATE {} AS t SET {shadow} = u.id
        FROM unnest($1::{}, $2::UUID[]) AS u(key, id)
        WHERE t.{key} = u.key AND t.{shadow} IS NULL
        "#,
        qualified(schema, table),
        keys.sql_type(),
        key = quote_ident(key_column),
        shadow = quote_ident(shadow_column),
    );
    let result = keys
        .bind(sqlx::query(&sql))
        .bind(ids)
        .execute(conn)
        .await
        .map_err(|e| storage_error(e, table, shadow_column))?;
    Ok(result.rows_affected())
}

pub(crate) async fn count_missing(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    shadow_column: &str,
    source_column: Option<&str>,
) -> Result<u64, StorageError> {
    let mut sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
        qualified(schema, table),
        quote_ident(shadow_column)
    );
    if let Some(source) = source_column {
        sql.push_str(&format!(" AND {} IS NOT NULL", quote_ident(source)));
    }
    count(conn, &sql, table, shadow_column).await
}

pub(crate) async fn count_orphans(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    column: &str,
    ref_table: &str,
    ref_column: &str,
) -> Result<u64, StorageError> {
    let sql = format!(
        r#"
        SELECT COUNT(*) FROM {} AS t
        WHERE t.{column} IS NOT NULL
          AND NOT EXISTS (SELECT 1 FROM {} AS r WHERE r.{ref_column} = t.{column})
        "#,
        qualified(schema, table),
        qualified(schema, ref_table),
        column = quote_ident(column),
        ref_column = quote_ident(ref_column),
    );
    count(conn, &sql, table, column).await
}

pub(crate) async fn count_mistranslated(
    conn: &mut PgConnection,
    schema: &str,
    reference: &ReferenceTranslation<'_>,
) -> Result<u64, StorageError> {
    let sql = format!(
        r#"
        SELECT COUNT(*) FROM {} AS t
        LEFT JOIN {} AS r ON r.{referenced_key} = t.{column}
        WHERE t.{shadow} IS NOT NULL
          AND r.{referenced_shadow} IS DISTINCT FROM t.{shadow}
        "#,
        qualified(schema, reference.table),
        qualified(schema, reference.referenced_table),
        referenced_key = quote_ident(reference.referenced_key),
        column = quote_ident(reference.column),
        shadow = quote_ident(reference.shadow_column),
        referenced_shadow = quote_ident(reference.referenced_shadow),
    );
    count(conn, &sql, reference.table, reference.shadow_column).await
}

pub(crate) async fn lock_tables(
    conn: &mut PgConnection,
    schema: &str,
    tables: &[&str],
) -> Result<(), StorageError> {
    if tables.is_empty() {
        return Ok(());
    }
    let names = tables
        .iter()
        .map(|t| qualified(schema, t))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("LOCK TABLE {} IN ACCESS EXCLUSIVE MODE", names);
    execute(conn, &sql, tables[0], "").await
}
