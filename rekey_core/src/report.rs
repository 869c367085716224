//! The machine-readable outcome of a migration run.

use crate::phase::MigrationPhase;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which consistency check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationKind {
    /// Shadow values still NULL.
    IncompleteBackfill,
    /// References to rows that don't exist.
    OrphanedReferences,
    /// Shadow references that disagree with the old reference.
    MistranslatedReferences,
}

/// A failed consistency check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationFailure {
    /// The check.
    pub kind: VerificationKind,
    /// Table checked.
    pub table: String,
    /// Column checked.
    pub column: String,
    /// Number of offending rows.
    pub count: u64,
}

/// Summary of a migration run.
///
/// A report is produced for every run, successful or not. On any outcome
/// other than [`MigrationPhase::Complete`], `reason` says why the run stopped
/// and `reached` names the last phase that was fully entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// `Complete` or `Aborted`.
    pub phase: MigrationPhase,
    /// Last phase fully reached before the run ended.
    pub reached: MigrationPhase,
    /// Rows written per shadow column, keyed `table.column`.
    pub rows_backfilled: BTreeMap<String, u64>,
    /// Failed consistency checks.
    pub verification_failures: Vec<VerificationFailure>,
    /// Why the run did not complete.
    pub reason: Option<String>,
    /// The run stopped after the swap; an operator has to finish it.
    pub manual_intervention_required: bool,
    /// Failures while dropping shadow columns after an abort.
    pub cleanup_errors: Vec<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run ended.
    pub finished_at: DateTime<Utc>,
}

impl MigrationReport {
    /// Whether the migration finished.
    pub fn is_complete(&self) -> bool {
        self.phase == MigrationPhase::Complete
    }

    /// Total rows written across all shadow columns.
    pub fn total_rows_backfilled(&self) -> u64 {
        self.rows_backfilled.values().sum()
    }
}

/// Records finished runs somewhere an operator can find them.
#[async_trait]
pub trait MigrationJournal: Send + Sync {
    /// Records a finished run.
    async fn record(
        &self,
        plan: &crate::plan::MigrationPlan,
        report: &MigrationReport,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
