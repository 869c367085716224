//! Run reports persisted in `rekey_runs`.

use async_trait::async_trait;
use rekey_core::prelude::*;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

/// A [`MigrationJournal`] writing one row per finished run.
///
/// Runs of the same plan share a checksum, so an operator can look up what
/// happened to a plan across restarts.
#[derive(Debug, Clone)]
pub struct PgMigrationJournal {
    pool: PgPool,
}

impl PgMigrationJournal {
    /// Creates a journal over `pool`. The bookkeeping migrations must have run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Reports recorded for `plan`, newest first.
    pub async fn history(&self, plan: &MigrationPlan) -> Result<Vec<MigrationReport>, sqlx::Error> {
        let checksum = plan_checksum(plan).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let reports: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT report FROM rekey_runs WHERE plan_checksum = $1 ORDER BY id DESC",
        )
        .bind(checksum)
        .fetch_all(&self.pool)
        .await?;

        reports
            .into_iter()
            .map(|(report,)| {
                serde_json::from_value(report).map_err(|e| sqlx::Error::Decode(Box::new(e)))
            })
            .collect()
    }
}

/// SHA-256 of the plan's JSON form.
pub fn plan_checksum(plan: &MigrationPlan) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_vec(plan)?;
    Ok(format!("{:x}", Sha256::digest(&encoded)))
}

#[async_trait]
impl MigrationJournal for PgMigrationJournal {
    async fn record(
        &self,
        plan: &MigrationPlan,
        report: &MigrationReport,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        sqlx::query(
            r#"
            INSERT INTO rekey_runs
                (plan_checksum, phase, succeeded, manual_intervention_required, report)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(plan_checksum(plan)?)
        .bind(report.reached.to_string())
        .bind(report.is_complete())
        .bind(report.manual_intervention_required)
        .bind(serde_json::to_value(report)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(table: &str) -> MigrationPlan {
        MigrationPlan::builder()
            .table(table, "id")
            .build()
            .unwrap()
    }

    #[test]
    fn checksums_identify_plans() {
        assert_eq!(
            plan_checksum(&plan("colors")).unwrap(),
            plan_checksum(&plan("colors")).unwrap()
        );
        assert_ne!(
            plan_checksum(&plan("colors")).unwrap(),
            plan_checksum(&plan("products")).unwrap()
        );
    }
}
