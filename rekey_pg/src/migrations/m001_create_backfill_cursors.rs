//! Migration 001: backfill cursor table.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates `rekey_backfill_cursors`, one row per shadow column being filled.
pub struct CreateBackfillCursors;

#[async_trait]
impl Migration for CreateBackfillCursors {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_backfill_cursors"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rekey_backfill_cursors (
                table_name TEXT NOT NULL,
                shadow_column TEXT NOT NULL,
                last_key JSONB NOT NULL,
                rows_processed BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (table_name, shadow_column)
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
