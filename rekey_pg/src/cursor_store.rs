//! Backfill cursors persisted in `rekey_backfill_cursors`.

use crate::error::storage_error;
use async_trait::async_trait;
use rekey_core::prelude::*;
use sqlx::{FromRow, PgPool};

const TABLE: &str = "rekey_backfill_cursors";

/// A [`CursorStore`] that survives process restarts.
///
/// Requires the bookkeeping migrations; run
/// [`Migrator`](crate::migrations::Migrator) first.
#[derive(Debug, Clone)]
pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    /// Creates a store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct CursorRow {
    table_name: String,
    shadow_column: String,
    last_key: serde_json::Value,
    rows_processed: i64,
}

impl TryFrom<CursorRow> for BackfillCursor {
    type Error = StorageError;

    fn try_from(row: CursorRow) -> Result<Self, Self::Error> {
        let last_key: Option<Value> = serde_json::from_value(row.last_key).map_err(|e| {
            StorageError::Unexpected(format!(
                "corrupt cursor for {}.{}: {}",
                row.table_name, row.shadow_column, e
            ))
        })?;
        Ok(BackfillCursor {
            table: row.table_name,
            shadow_column: row.shadow_column,
            last_key,
            rows_processed: row.rows_processed.max(0) as u64,
        })
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn load(
        &self,
        table: &str,
        shadow_column: &str,
    ) -> Result<Option<BackfillCursor>, StorageError> {
        let row: Option<CursorRow> = sqlx::query_as(
            r#"
            SELECT table_name, shadow_column, last_key, rows_processed
            FROM rekey_backfill_cursors
            WHERE table_name = $1 AND shadow_column = $2
            "#,
        )
        .bind(table)
        .bind(shadow_column)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error(e, TABLE, "last_key"))?;
        row.map(BackfillCursor::try_from).transpose()
    }

    async fn save(&self, cursor: &BackfillCursor) -> Result<(), StorageError> {
        let last_key = serde_json::to_value(&cursor.last_key)
            .map_err(|e| StorageError::Unexpected(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO rekey_backfill_cursors
                (table_name, shadow_column, last_key, rows_processed, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (table_name, shadow_column) DO UPDATE
            SET last_key = EXCLUDED.last_key,
                rows_processed = EXCLUDED.rows_processed,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&cursor.table)
        .bind(&cursor.shadow_column)
        .bind(last_key)
        .bind(i64::try_from(cursor.rows_processed).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(e, TABLE, "last_key"))?;
        Ok(())
    }

    async fn clear(&self, table: &str, shadow_column: &str) -> Result<(), StorageError> {
        sqlx::query(
            "DELETE FROM rekey_backfill_cursors WHERE table_name = $1 AND shadow_column = $2",
        )
        .bind(table)
        .bind(shadow_column)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(e, TABLE, "last_key"))?;
        Ok(())
    }
}
