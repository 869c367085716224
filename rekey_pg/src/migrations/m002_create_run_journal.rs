//! Migration 002: run journal.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates `rekey_runs`, which keeps the report of every finished run.
pub struct CreateRunJournal;

#[async_trait]
impl Migration for CreateRunJournal {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "create_run_journal"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rekey_runs (
                id BIGSERIAL PRIMARY KEY,
                plan_checksum VARCHAR(64) NOT NULL,
                phase TEXT NOT NULL,
                succeeded BOOLEAN NOT NULL,
                manual_intervention_required BOOLEAN NOT NULL,
                report JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        // Looking up the latest run of a plan is the common query.
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_rekey_runs_plan_checksum
            ON rekey_runs (plan_checksum, id DESC)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
