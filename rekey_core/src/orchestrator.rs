//! Sequencing of the online migration protocol.
//!
//! The [`Orchestrator`] owns the storage engine handle for the duration of a
//! run and walks a [`MigrationRun`] through the phases in
//! [`MigrationPhase`]. Each call to [`MigrationRun::advance`] performs exactly
//! one transition, so callers (and tests) can stop between phases.
//!
//! ```rust,ignore
//! use rekey_core::prelude::*;
//!
//! let orchestrator = Orchestrator::new(engine).with_config(MigrationConfig {
//!     batch_size: 1000,
//!     ..Default::default()
//! });
//! let report = orchestrator.run(&plan).await;
//! if !report.is_complete() {
//!     eprintln!("stopped at {}: {:?}", report.reached, report.reason);
//! }
//! ```
//!
//! # Point of no return
//!
//! Everything up to `Verified` only adds shadow columns and writes to them;
//! aborting there leaves the old columns intact and drops the shadows again
//! (see [`MigrationConfig::cleanup_on_abort`]). The swap into `SwappedIn`
//! drops the old columns. Any failure from that step onwards stops the run
//! with `manual_intervention_required` set and nothing is undone.

use crate::backfill::{BackfillDriver, BackfillTarget, CursorStore};
use crate::cancel::AbortHandle;
use crate::config::{MigrationConfig, RetryConfig};
use crate::error::{MigrationError, StorageError};
use crate::identifier::{IdentifierGenerator, TimeOrderedGenerator};
use crate::phase::MigrationPhase;
use crate::plan::{MigrationPlan, ReferenceColumn, TablePlan};
use crate::report::{MigrationJournal, MigrationReport, VerificationFailure};
use crate::retry::retry_transient;
use crate::storage::{StorageEngine, SwapBoundary};
use crate::value::ColumnDef;
use crate::verify::ConsistencyVerifier;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use log::{error, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Drives migrations against one storage engine.
pub struct Orchestrator<E> {
    engine: E,
    config: MigrationConfig,
    generator: Arc<dyn IdentifierGenerator>,
    cursors: Option<Arc<dyn CursorStore>>,
    journal: Option<Arc<dyn MigrationJournal>>,
    abort: AbortHandle,
}

impl<E> Orchestrator<E>
where
    E: StorageEngine,
{
    /// Creates an orchestrator with the default configuration.
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            config: MigrationConfig::default(),
            generator: Arc::new(TimeOrderedGenerator::new()),
            cursors: None,
            journal: None,
            abort: AbortHandle::new(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the identifier generator.
    pub fn with_generator(mut self, generator: Arc<dyn IdentifierGenerator>) -> Self {
        self.generator = generator;
        self
    }

    /// Persists backfill cursors in `cursors`.
    pub fn with_cursor_store(mut self, cursors: Arc<dyn CursorStore>) -> Self {
        self.cursors = Some(cursors);
        self
    }

    /// Records every finished run in `journal`.
    pub fn with_journal(mut self, journal: Arc<dyn MigrationJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// A handle that cancels runs started by this orchestrator.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// The engine being migrated.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The active configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Releases the engine handle.
    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Starts a run in the `Planned` phase without touching the engine.
    pub fn start<'a>(&'a self, plan: &'a MigrationPlan) -> MigrationRun<'a, E> {
        info!(
            "Planning migration of {} tables and {} references",
            plan.tables().len(),
            plan.references().len()
        );
        MigrationRun {
            orchestrator: self,
            plan,
            phase: MigrationPhase::Planned,
            reached: MigrationPhase::Planned,
            rows_backfilled: BTreeMap::new(),
            not_null_references: BTreeSet::new(),
            verification_failures: Vec::new(),
            cleanup_errors: Vec::new(),
            reason: None,
            manual_intervention_required: false,
            started_at: Utc::now(),
        }
    }

    /// Runs `plan` to completion or abort and reports the outcome.
    ///
    /// # Returns
    /// A [`MigrationReport`] in every case; failures are described by its
    /// `phase`, `reached` and `reason` fields rather than returned as errors.
    /// The report is also handed to the journal, if one is configured.
    pub async fn run(&self, plan: &MigrationPlan) -> MigrationReport {
        self.start(plan).run_to_end().await
    }
}

/// A single migration run.
pub struct MigrationRun<'a, E> {
    orchestrator: &'a Orchestrator<E>,
    plan: &'a MigrationPlan,
    phase: MigrationPhase,
    reached: MigrationPhase,
    rows_backfilled: BTreeMap<String, u64>,
    /// `(table, column)` of references that were NOT NULL before the run.
    not_null_references: BTreeSet<(String, String)>,
    verification_failures: Vec<VerificationFailure>,
    cleanup_errors: Vec<String>,
    reason: Option<String>,
    manual_intervention_required: bool,
    started_at: DateTime<Utc>,
}

impl<'a, E> MigrationRun<'a, E>
where
    E: StorageEngine,
{
    /// The current phase.
    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    /// Performs the next transition.
    ///
    /// On failure the run moves to `Aborted` (cleaning up if that is still
    /// safe) and the error is returned.
    pub async fn advance(&mut self) -> Result<MigrationPhase, MigrationError> {
        let from = self.phase;
        let Some(to) = from.next() else {
            return Err(MigrationError::InvalidTransition { from, to: from });
        };

        let outcome = if self.orchestrator.abort.is_requested() {
            Err(MigrationError::Cancelled(from))
        } else {
            info!("Migration phase {} -> {}", from, to);
            match to {
                MigrationPhase::ShadowColumnsAdded => self.add_shadow_columns().await,
                MigrationPhase::Backfilling => self.backfill().await,
                MigrationPhase::Verified => self.catch_up_and_verify().await,
                MigrationPhase::SwappedIn => self.swap_in().await,
                MigrationPhase::IndexesRebuilt => self.rebuild_indexes().await,
                MigrationPhase::Complete => self.final_check().await,
                MigrationPhase::Planned | MigrationPhase::Aborted => {
                    Err(MigrationError::InvalidTransition { from, to })
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.phase = to;
                self.reached = to;
                Ok(to)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Aborts the run from its current phase.
    pub async fn abort(&mut self, reason: &str) -> Result<(), MigrationError> {
        if self.phase.is_terminal() {
            return Err(MigrationError::InvalidTransition {
                from: self.phase,
                to: MigrationPhase::Aborted,
            });
        }
        self.fail(MigrationError::Cancelled(self.phase)).await;
        self.reason = Some(reason.to_string());
        Ok(())
    }

    /// Advances until the run completes or aborts, then reports.
    pub async fn run_to_end(mut self) -> MigrationReport {
        while !self.phase.is_terminal() {
            if self.advance().await.is_err() {
                break;
            }
        }
        let report = self.report();
        if let Some(journal) = &self.orchestrator.journal
            && let Err(e) = journal.record(self.plan, &report).await
        {
            warn!("Failed to record migration report: {}", e);
        }
        report
    }

    /// The report for the run so far.
    pub fn report(&self) -> MigrationReport {
        MigrationReport {
            phase: self.phase,
            reached: self.reached,
            rows_backfilled: self.rows_backfilled.clone(),
            verification_failures: self.verification_failures.clone(),
            reason: self.reason.clone(),
            manual_intervention_required: self.manual_intervention_required,
            cleanup_errors: self.cleanup_errors.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }

    fn engine(&self) -> &'a E {
        &self.orchestrator.engine
    }

    fn config(&self) -> &'a MigrationConfig {
        &self.orchestrator.config
    }

    fn verifier(&self) -> ConsistencyVerifier<'a, E> {
        ConsistencyVerifier::new(self.engine(), self.config().retry.clone())
    }

    /// Moves to `Aborted`, deciding between cleanup and manual intervention.
    async fn fail(&mut self, err: MigrationError) -> MigrationError {
        let err = if self.phase.is_past_point_of_no_return()
            && !matches!(err, MigrationError::IrreversibleStepFailure { .. })
        {
            if let Some(failure) = err.verification_failure() {
                self.verification_failures.push(failure);
            }
            MigrationError::IrreversibleStepFailure {
                phase: self.phase,
                reason: err.to_string(),
            }
        } else {
            if let Some(failure) = err.verification_failure() {
                self.verification_failures.push(failure);
            }
            err
        };

        let needs_operator = matches!(
            err,
            MigrationError::IrreversibleStepFailure { .. } | MigrationError::AlreadySwapped { .. }
        );
        if needs_operator {
            error!(
                "Migration stopped at {} and needs manual intervention: {}",
                self.phase, err
            );
            self.manual_intervention_required = true;
        } else {
            warn!("Migration aborted during {}: {}", self.phase, err);
            if self.config().cleanup_on_abort {
                self.cleanup().await;
            }
        }

        self.reason = Some(err.to_string());
        self.phase = MigrationPhase::Aborted;
        err
    }

    /// Best-effort removal of shadow columns. Failures are logged and kept
    /// in the report, never escalated.
    async fn cleanup(&mut self) {
        let mut tables: Vec<&TablePlan> = self.plan.topological_order().collect();
        tables.reverse();

        for table in tables {
            let mut shadows: Vec<(&str, &str)> = self
                .plan
                .references_from(&table.table)
                .map(|r| (r.table.as_str(), r.shadow_column.as_str()))
                .collect();
            shadows.push((table.table.as_str(), table.shadow_column.as_str()));

            for (table_name, shadow) in shadows {
                if let Err(e) = self.drop_shadow(table_name, shadow).await {
                    error!("Failed to drop shadow column {}.{}: {}", table_name, shadow, e);
                    self.cleanup_errors
                        .push(format!("{}.{}: {}", table_name, shadow, e));
                }
            }
        }
    }

    async fn drop_shadow(&self, table: &str, shadow: &str) -> Result<(), StorageError> {
        let retry = &self.config().retry;
        let engine = self.engine();
        let description =
            retry_transient(retry, "describe table", || engine.describe_table(table)).await?;
        if description.has_column(shadow) {
            retry_transient(retry, "drop shadow column", || engine.drop_column(table, shadow))
                .await?;
            info!("Dropped shadow column {}.{}", table, shadow);
        }
        if let Some(cursors) = &self.orchestrator.cursors {
            cursors.clear(table, shadow).await?;
        }
        Ok(())
    }

    /// `Planned -> ShadowColumnsAdded`
    async fn add_shadow_columns(&mut self) -> Result<(), MigrationError> {
        self.preflight().await?;
        for table in self.plan.topological_order() {
            self.ensure_column(&table.table, &table.shadow_def()).await?;
            self.ensure_unique_index(&table.table, &table.shadow_column)
                .await?;
            for reference in self.plan.references_from(&table.table) {
                let shadow = ColumnDef::new(&reference.shadow_column, table.shadow_type.clone());
                self.ensure_column(&reference.table, &shadow).await?;
            }
        }
        Ok(())
    }

    /// Checks that every planned column exists with a type usable as a key
    /// and that no earlier run has already swapped part of the plan into
    /// place. Remembers which references are NOT NULL so the constraint can
    /// be put back after the swap.
    async fn preflight(&mut self) -> Result<(), MigrationError> {
        let retry = &self.config().retry;
        let engine = self.engine();
        let plan = self.plan;
        for table in plan.topological_order() {
            let description = retry_transient(retry, "describe table", || {
                engine.describe_table(&table.table)
            })
            .await?;

            let identity = description
                .column(&table.identity_column)
                .ok_or_else(|| StorageError::unknown_column(&table.table, &table.identity_column))?;
            if identity.column_type == table.shadow_type
                && !description.has_column(&table.shadow_column)
            {
                return Err(MigrationError::AlreadySwapped {
                    table: table.table.clone(),
                    column: table.identity_column.clone(),
                });
            }
            require_key_type(&table.table, identity)?;
            if let Some(created_at) = &table.created_at_column
                && !description.has_column(created_at)
            {
                return Err(StorageError::unknown_column(&table.table, created_at).into());
            }

            for reference in plan.references_from(&table.table) {
                let column = description
                    .column(&reference.column)
                    .ok_or_else(|| {
                        StorageError::unknown_column(&reference.table, &reference.column)
                    })?;
                if column.column_type == table.shadow_type
                    && !description.has_column(&reference.shadow_column)
                {
                    return Err(MigrationError::AlreadySwapped {
                        table: reference.table.clone(),
                        column: reference.column.clone(),
                    });
                }
                require_key_type(&reference.table, column)?;
                if !column.nullable {
                    self.not_null_references
                        .insert((reference.table.clone(), reference.column.clone()));
                }
            }
        }
        Ok(())
    }

    /// Whether `reference` gets a NOT NULL constraint once swapped in: only
    /// when the old column had one and the plan doesn't relax it.
    fn restores_not_null(&self, reference: &ReferenceColumn) -> bool {
        !reference.nullable
            && self
                .not_null_references
                .contains(&(reference.table.clone(), reference.column.clone()))
    }

    async fn ensure_column(&self, table: &str, column: &ColumnDef) -> Result<(), MigrationError> {
        let retry = &self.config().retry;
        let engine = self.engine();
        match retry_transient(retry, "add shadow column", || engine.add_column(table, column)).await
        {
            Ok(()) => {
                info!("Added shadow column {}.{}", table, column.name);
                Ok(())
            }
            Err(StorageError::SchemaConflict { detail, .. }) => {
                let existing =
                    retry_transient(retry, "describe table", || engine.describe_table(table))
                        .await?;
                match existing.column(&column.name) {
                    Some(found) if found.column_type == column.column_type => {
                        info!(
                            "Shadow column {}.{} already present, resuming",
                            table, column.name
                        );
                        Ok(())
                    }
                    _ => Err(StorageError::conflict(table, &column.name, detail).into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_unique_index(&self, table: &str, column: &str) -> Result<(), MigrationError> {
        let retry = &self.config().retry;
        let engine = self.engine();
        match retry_transient(retry, "add unique index", || {
            engine.add_unique_index(table, column)
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(StorageError::SchemaConflict { .. }) => {
                info!("Unique index on {}.{} already present", table, column);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn driver(&self) -> BackfillDriver<'a, E> {
        let orchestrator = self.orchestrator;
        let mut driver = BackfillDriver::new(&orchestrator.engine, orchestrator.generator.as_ref())
            .with_retry(orchestrator.config.retry.clone())
            .with_abort_handle(orchestrator.abort.clone());
        if let Some(cursors) = &orchestrator.cursors {
            driver = driver.with_cursor_store(cursors.as_ref());
        }
        driver
    }

    /// Backfills one table's identity and then its references, returning
    /// rows written per shadow column.
    async fn backfill_table(
        &self,
        driver: &BackfillDriver<'a, E>,
        table: &TablePlan,
        verify: bool,
    ) -> Result<Vec<(String, u64)>, MigrationError> {
        let batch_size = self.config().batch_size;
        let mut counts = Vec::new();

        let target = BackfillTarget::Identity(table);
        let written = driver.backfill(target, batch_size).await?;
        counts.push((target.label(), written));

        for reference in self.plan.references_from(&table.table) {
            let Some(referenced) = self.plan.table(&reference.references) else {
                continue;
            };
            let target = BackfillTarget::Reference {
                reference,
                owner: table,
                referenced,
            };
            let written = driver.backfill(target, batch_size).await?;
            counts.push((target.label(), written));
        }

        if verify {
            let verifier = self.verifier();
            match verifier.verify_table(self.plan, table).await {
                // Rows inserted behind the batch loop are left to the
                // catch-up pass; what was written must still be right.
                Err(MigrationError::IncompleteBackfill { column, count, .. }) => {
                    info!(
                        "{} rows of {} arrived after {} was backfilled, deferring to catch-up",
                        count, table.table, column
                    );
                    verifier
                        .verify_written_references(self.plan, table)
                        .await?;
                }
                outcome => outcome?,
            }
        }
        Ok(counts)
    }

    /// Backfills every table, one dependency level at a time.
    async fn backfill_levels(&mut self, verify: bool) -> Result<u64, MigrationError> {
        let driver = self.driver();
        let parallel = self.config().parallel_tables;
        let mut total = 0;

        for level in self.plan.levels() {
            let tables: Vec<&'a TablePlan> = level
                .iter()
                .filter_map(|name| self.plan.table(name))
                .collect();

            let results = if parallel && tables.len() > 1 {
                try_join_all(
                    tables
                        .iter()
                        .map(|&table| self.backfill_table(&driver, table, verify)),
                )
                .await?
            } else {
                let mut results = Vec::with_capacity(tables.len());
                for &table in &tables {
                    results.push(self.backfill_table(&driver, table, verify).await?);
                }
                results
            };

            for (label, written) in results.into_iter().flatten() {
                total += written;
                *self.rows_backfilled.entry(label).or_default() += written;
            }
        }
        Ok(total)
    }

    /// `ShadowColumnsAdded -> Backfilling`
    async fn backfill(&mut self) -> Result<(), MigrationError> {
        let total = self.backfill_levels(true).await?;
        info!("Backfill wrote {} rows", total);
        Ok(())
    }

    /// `Backfilling -> Verified`
    ///
    /// Rows inserted by application traffic after the first pass went by
    /// have no shadow value yet. Whenever the global check finds such rows a
    /// catch-up pass fills them, at most `catch_up_passes` times.
    async fn catch_up_and_verify(&mut self) -> Result<(), MigrationError> {
        let mut passes = 0;
        loop {
            match self.verifier().verify_plan(self.plan).await {
                Err(MigrationError::IncompleteBackfill {
                    table,
                    column,
                    count,
                }) if passes < self.config().catch_up_passes => {
                    passes += 1;
                    info!(
                        "{} rows of {} have no {} yet, starting catch-up pass {}",
                        count, table, column, passes
                    );
                    let caught_up = self.backfill_levels(false).await?;
                    info!("Catch-up pass {} wrote {} rows", passes, caught_up);
                }
                outcome => return outcome,
            }
        }
    }

    /// `Verified -> SwappedIn`
    async fn swap_in(&mut self) -> Result<(), MigrationError> {
        // Referencing tables go first so no old identity column is dropped
        // while a foreign key still points at it.
        let mut tables: Vec<&'a TablePlan> = self.plan.topological_order().collect();
        tables.reverse();

        let groups: Vec<Vec<&'a TablePlan>> =
            if self.engine().capabilities().multi_table_ddl_transactions {
                vec![tables]
            } else {
                tables.into_iter().map(|table| vec![table]).collect()
            };

        let mut committed = 0;
        for group in &groups {
            match self.swap_group(group).await {
                Ok(caught_up) => {
                    committed += 1;
                    for (label, written) in caught_up {
                        *self.rows_backfilled.entry(label).or_default() += written;
                    }
                }
                Err(e) if committed == 0 => return Err(e),
                Err(MigrationError::IrreversibleStepFailure { reason, .. }) => {
                    return Err(MigrationError::IrreversibleStepFailure {
                        phase: MigrationPhase::SwappedIn,
                        reason: format!(
                            "{} of {} tables already swapped: {}",
                            committed,
                            groups.len(),
                            reason
                        ),
                    });
                }
                Err(e) => {
                    if let Some(failure) = e.verification_failure() {
                        self.verification_failures.push(failure);
                    }
                    return Err(MigrationError::IrreversibleStepFailure {
                        phase: MigrationPhase::SwappedIn,
                        reason: format!(
                            "{} of {} tables already swapped: {}",
                            committed,
                            groups.len(),
                            e
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Swaps one group of tables inside a single boundary and returns the
    /// rows written by the catch-up under the lock.
    async fn swap_group(
        &self,
        group: &[&'a TablePlan],
    ) -> Result<Vec<(String, u64)>, MigrationError> {
        let engine = self.engine();

        let mut locked: BTreeSet<&str> = group.iter().map(|t| t.table.as_str()).collect();
        for table in group {
            locked.extend(
                self.plan
                    .references_from(&table.table)
                    .map(|r| r.references.as_str()),
            );
        }
        let locked: Vec<&str> = locked.into_iter().collect();
        let locked = locked.as_slice();

        // A lock timeout is transient; start over with a fresh boundary.
        let boundary = retry_transient(
            &self.config().retry,
            "lock tables for swap",
            move || async move {
                let boundary = engine.begin_swap().await?;
                match boundary.lock_tables(locked).await {
                    Ok(()) => Ok(boundary),
                    Err(e) => {
                        discard(boundary).await;
                        Err(e)
                    }
                }
            },
        )
        .await?;

        // Writers may have slipped in since `Verified`. Nothing new can
        // arrive now that the tables are locked, so fill and check once more.
        let caught_up = match self.catch_up_locked(boundary.as_ref(), group, locked).await {
            Ok(counts) => counts,
            Err(e) => {
                discard(boundary).await;
                return Err(e);
            }
        };
        if let Err(e) = self.verify_group(boundary.as_ref(), group).await {
            discard(boundary).await;
            return Err(e);
        }

        let names = group
            .iter()
            .map(|t| t.table.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        if let Err(e) = self.apply_swap(boundary.as_ref(), group).await {
            discard(boundary).await;
            return Err(MigrationError::IrreversibleStepFailure {
                phase: MigrationPhase::SwappedIn,
                reason: format!("swap of {} failed and was rolled back: {}", names, e),
            });
        }

        boundary
            .commit()
            .await
            .map_err(|e| MigrationError::IrreversibleStepFailure {
                phase: MigrationPhase::SwappedIn,
                reason: format!("commit of swap for {} failed: {}", names, e),
            })?;
        info!("Swapped new identifiers into {}", names);
        Ok(caught_up)
    }

    /// Backfills, through the boundary, the identities of every locked table
    /// and the references owned by `group`.
    async fn catch_up_locked(
        &self,
        boundary: &dyn SwapBoundary,
        group: &[&'a TablePlan],
        locked: &[&str],
    ) -> Result<Vec<(String, u64)>, MigrationError> {
        let driver = BackfillDriver::new(boundary, self.orchestrator.generator.as_ref())
            .with_retry(RetryConfig::disabled());
        let batch_size = self.config().batch_size;
        let mut counts = Vec::new();

        for table in self
            .plan
            .topological_order()
            .filter(|t| locked.iter().any(|&name| name == t.table))
        {
            let target = BackfillTarget::Identity(table);
            counts.push((target.label(), driver.backfill(target, batch_size).await?));
        }
        for &table in group {
            for reference in self.plan.references_from(&table.table) {
                let Some(referenced) = self.plan.table(&reference.references) else {
                    continue;
                };
                let target = BackfillTarget::Reference {
                    reference,
                    owner: table,
                    referenced,
                };
                counts.push((target.label(), driver.backfill(target, batch_size).await?));
            }
        }
        Ok(counts)
    }

    async fn verify_group(
        &self,
        boundary: &dyn SwapBoundary,
        group: &[&'a TablePlan],
    ) -> Result<(), MigrationError> {
        let verifier = ConsistencyVerifier::new(boundary, RetryConfig::disabled());
        for table in group {
            verifier.verify_table(self.plan, table).await?;
        }
        Ok(())
    }

    async fn apply_swap(
        &self,
        boundary: &dyn SwapBoundary,
        group: &[&'a TablePlan],
    ) -> Result<(), StorageError> {
        for table in group {
            for reference in self.plan.references_from(&table.table) {
                boundary
                    .drop_column(&reference.table, &reference.column)
                    .await?;
                boundary
                    .rename_column(&reference.table, &reference.shadow_column, &reference.column)
                    .await?;
            }
            boundary
                .drop_column(&table.table, &table.identity_column)
                .await?;
            boundary
                .rename_column(&table.table, &table.shadow_column, &table.identity_column)
                .await?;
        }
        Ok(())
    }

    /// `SwappedIn -> IndexesRebuilt`
    async fn rebuild_indexes(&mut self) -> Result<(), MigrationError> {
        let retry = &self.config().retry;
        let engine = self.engine();

        for table in self.plan.topological_order() {
            // The shadow's unique index survives the rename under its old
            // name; the primary key replaces it.
            match retry_transient(retry, "drop shadow index", || {
                engine.drop_index(&table.table, &table.shadow_column)
            })
            .await
            {
                Ok(()) | Err(StorageError::SchemaConflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            retry_transient(retry, "add primary key", || {
                engine.add_primary_key(&table.table, &table.identity_column)
            })
            .await?;
        }

        for reference in self.plan.references() {
            let Some(referenced) = self.plan.table(&reference.references) else {
                continue;
            };
            if self.restores_not_null(reference) {
                retry_transient(retry, "set not null", || {
                    engine.set_not_null(&reference.table, &reference.column)
                })
                .await?;
            }
            retry_transient(retry, "add foreign key", || {
                engine.add_foreign_key(
                    &reference.table,
                    &reference.column,
                    &referenced.table,
                    &referenced.identity_column,
                )
            })
            .await?;
        }
        info!("Rebuilt keys and constraints");
        Ok(())
    }

    /// `IndexesRebuilt -> Complete`
    async fn final_check(&mut self) -> Result<(), MigrationError> {
        self.verifier().verify_swapped(self.plan).await?;
        info!(
            "Migration complete: {} rows backfilled",
            self.rows_backfilled.values().sum::<u64>()
        );
        Ok(())
    }
}

fn require_key_type(table: &str, column: &ColumnDef) -> Result<(), MigrationError> {
    if column.column_type.is_key_type() {
        return Ok(());
    }
    Err(MigrationError::UnsupportedKeyType {
        table: table.to_string(),
        column: column.name.clone(),
        found: column.column_type.clone(),
    })
}

async fn discard(boundary: Box<dyn SwapBoundary + '_>) {
    if let Err(e) = boundary.rollback().await {
        error!("Failed to roll back swap boundary: {}", e);
    }
}
