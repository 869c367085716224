//! Read-only consistency checks that gate destructive steps.

use crate::config::RetryConfig;
use crate::error::MigrationError;
use crate::plan::{MigrationPlan, ReferenceColumn, TablePlan};
use crate::retry::retry_transient;
use crate::storage::{ConsistencyQueries, ReferenceTranslation};
use log::{debug, warn};

/// Runs the completeness and referential checks against an engine or a swap
/// boundary.
pub struct ConsistencyVerifier<'a, Q: ?Sized> {
    queries: &'a Q,
    retry: RetryConfig,
}

impl<'a, Q> ConsistencyVerifier<'a, Q>
where
    Q: ConsistencyQueries + ?Sized,
{
    /// Creates a verifier reading through `queries`.
    pub fn new(queries: &'a Q, retry: RetryConfig) -> Self {
        Self { queries, retry }
    }

    /// Fails with [`MigrationError::IncompleteBackfill`] if any row still has
    /// a NULL `shadow_column` (ignoring rows whose `source_column` is NULL).
    pub async fn verify_complete(
        &self,
        table: &str,
        shadow_column: &str,
        source_column: Option<&str>,
    ) -> Result<(), MigrationError> {
        let count = retry_transient(&self.retry, "count missing shadow values", || {
            self.queries
                .count_missing(table, shadow_column, source_column)
        })
        .await?;
        if count > 0 {
            warn!("{} rows in {} have no {}", count, table, shadow_column);
            return Err(MigrationError::IncompleteBackfill {
                table: table.to_string(),
                column: shadow_column.to_string(),
                count,
            });
        }
        debug!("{}.{} is complete", table, shadow_column);
        Ok(())
    }

    /// Fails with [`MigrationError::OrphanedReferences`] if any non-null
    /// `table.column` value has no matching `ref_table.ref_column` row.
    pub async fn verify_no_orphans(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<(), MigrationError> {
        let count = retry_transient(&self.retry, "count orphaned references", || {
            self.queries
                .count_orphans(table, column, ref_table, ref_column)
        })
        .await?;
        if count > 0 {
            warn!(
                "{} values in {}.{} have no match in {}.{}",
                count, table, column, ref_table, ref_column
            );
            return Err(MigrationError::OrphanedReferences {
                table: table.to_string(),
                column: column.to_string(),
                count,
            });
        }
        debug!("{}.{} has no orphans", table, column);
        Ok(())
    }

    /// Fails with [`MigrationError::MistranslatedReferences`] if a shadow
    /// reference no longer matches the row its old reference points at.
    pub async fn verify_translated(
        &self,
        reference: &ReferenceTranslation<'_>,
    ) -> Result<(), MigrationError> {
        let count = retry_transient(&self.retry, "count mistranslated references", || {
            self.queries.count_mistranslated(reference)
        })
        .await?;
        if count > 0 {
            warn!(
                "{} rows in {}.{} disagree with {}",
                count, reference.table, reference.shadow_column, reference.column
            );
            return Err(MigrationError::MistranslatedReferences {
                table: reference.table.to_string(),
                column: reference.shadow_column.to_string(),
                count,
            });
        }
        Ok(())
    }

    /// Checks a table's shadow identity and all of its shadow references
    /// before the swap.
    pub async fn verify_table(
        &self,
        plan: &MigrationPlan,
        table: &TablePlan,
    ) -> Result<(), MigrationError> {
        self.verify_complete(&table.table, &table.shadow_column, None)
            .await?;
        for reference in plan.references_from(&table.table) {
            let Some(referenced) = plan.table(&reference.references) else {
                continue;
            };
            self.verify_reference(table, reference, referenced).await?;
        }
        Ok(())
    }

    /// Checks the shadow references a table's backfill has written so far.
    ///
    /// Unlike [`verify_table`](Self::verify_table) this tolerates rows that
    /// are still waiting for a value, which concurrent inserts produce until
    /// the catch-up pass reaches them. Values already written must resolve
    /// and agree with their old reference.
    pub async fn verify_written_references(
        &self,
        plan: &MigrationPlan,
        table: &TablePlan,
    ) -> Result<(), MigrationError> {
        for reference in plan.references_from(&table.table) {
            let Some(referenced) = plan.table(&reference.references) else {
                continue;
            };
            self.verify_resolves(table, reference, referenced).await?;
        }
        Ok(())
    }

    /// Checks one shadow reference column before the swap.
    pub async fn verify_reference(
        &self,
        owner: &TablePlan,
        reference: &ReferenceColumn,
        referenced: &TablePlan,
    ) -> Result<(), MigrationError> {
        self.verify_complete(
            &reference.table,
            &reference.shadow_column,
            Some(&reference.column),
        )
        .await?;
        self.verify_resolves(owner, reference, referenced).await
    }

    async fn verify_resolves(
        &self,
        owner: &TablePlan,
        reference: &ReferenceColumn,
        referenced: &TablePlan,
    ) -> Result<(), MigrationError> {
        self.verify_no_orphans(
            &reference.table,
            &reference.shadow_column,
            &referenced.table,
            &referenced.shadow_column,
        )
        .await?;
        self.verify_translated(&translation(owner, reference, referenced))
            .await
    }

    /// Checks every table in the plan before the swap.
    pub async fn verify_plan(&self, plan: &MigrationPlan) -> Result<(), MigrationError> {
        for table in plan.topological_order() {
            self.verify_table(plan, table).await?;
        }
        Ok(())
    }

    /// Checks that every swapped-in reference resolves, once old columns
    /// are gone and shadows carry the old names.
    pub async fn verify_swapped(&self, plan: &MigrationPlan) -> Result<(), MigrationError> {
        for reference in plan.references() {
            let Some(referenced) = plan.table(&reference.references) else {
                continue;
            };
            self.verify_no_orphans(
                &reference.table,
                &reference.column,
                &referenced.table,
                &referenced.identity_column,
            )
            .await?;
        }
        Ok(())
    }
}

/// Builds the translation descriptor for a planned reference.
pub fn translation<'a>(
    owner: &'a TablePlan,
    reference: &'a ReferenceColumn,
    referenced: &'a TablePlan,
) -> ReferenceTranslation<'a> {
    ReferenceTranslation {
        table: &reference.table,
        key_column: &owner.identity_column,
        column: &reference.column,
        shadow_column: &reference.shadow_column,
        referenced_table: &referenced.table,
        referenced_key: &referenced.identity_column,
        referenced_shadow: &referenced.shadow_column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FixedCounts {
        missing: u64,
        orphans: u64,
        mistranslated: u64,
        failures_left: AtomicUsize,
    }

    impl FixedCounts {
        fn answer(&self, count: u64) -> Result<u64, StorageError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Unavailable("connection reset".into()));
            }
            Ok(count)
        }
    }

    #[async_trait]
    impl ConsistencyQueries for FixedCounts {
        async fn count_missing(
            &self,
            _table: &str,
            _shadow_column: &str,
            _source_column: Option<&str>,
        ) -> Result<u64, StorageError> {
            self.answer(self.missing)
        }

        async fn count_orphans(
            &self,
            _table: &str,
            _column: &str,
            _ref_table: &str,
            _ref_column: &str,
        ) -> Result<u64, StorageError> {
            self.answer(self.orphans)
        }

        async fn count_mistranslated(
            &self,
            _reference: &ReferenceTranslation<'_>,
        ) -> Result<u64, StorageError> {
            self.answer(self.mistranslated)
        }
    }

    fn plan() -> MigrationPlan {
        MigrationPlan::builder()
            .table("colors", "id")
            .table("products", "id")
            .reference("products", "color_id", "colors")
            .build()
            .unwrap()
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn missing_values_fail_with_their_count() {
        let counts = FixedCounts {
            missing: 2,
            ..Default::default()
        };
        let verifier = ConsistencyVerifier::new(&counts, RetryConfig::disabled());

        let err = verifier
            .verify_complete("colors", "id_next", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::IncompleteBackfill { count: 2, ref table, .. } if table == "colors"
        ));
    }

    #[tokio::test]
    async fn mistranslated_references_fail_the_plan() {
        let counts = FixedCounts {
            mistranslated: 1,
            ..Default::default()
        };
        let verifier = ConsistencyVerifier::new(&counts, RetryConfig::disabled());

        let err = verifier.verify_plan(&plan()).await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::MistranslatedReferences { count: 1, ref column, .. }
                if column == "color_id_next"
        ));
    }

    #[tokio::test]
    async fn written_references_ignore_rows_still_pending() {
        let plan = plan();
        let products = plan.table("products").unwrap();
        let pending = FixedCounts {
            missing: 3,
            ..Default::default()
        };
        let verifier = ConsistencyVerifier::new(&pending, RetryConfig::disabled());
        verifier
            .verify_written_references(&plan, products)
            .await
            .unwrap();
        assert!(verifier.verify_table(&plan, products).await.is_err());

        let orphaned = FixedCounts {
            missing: 3,
            orphans: 1,
            ..Default::default()
        };
        let verifier = ConsistencyVerifier::new(&orphaned, RetryConfig::disabled());
        let err = verifier
            .verify_written_references(&plan, products)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::OrphanedReferences { count: 1, .. }));
    }

    #[tokio::test]
    async fn swapped_orphans_are_reported() {
        let counts = FixedCounts {
            orphans: 4,
            ..Default::default()
        };
        let verifier = ConsistencyVerifier::new(&counts, RetryConfig::disabled());

        let err = verifier.verify_swapped(&plan()).await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::OrphanedReferences { count: 4, ref column, .. } if column == "color_id"
        ));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let counts = FixedCounts {
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        };
        let verifier = ConsistencyVerifier::new(&counts, fast_retry());

        verifier.verify_plan(&plan()).await.unwrap();
    }
}
