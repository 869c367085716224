//! Error types for plans, storage engines and migration runs.

use crate::phase::MigrationPhase;
use crate::report::{VerificationFailure, VerificationKind};
use crate::value::ColumnType;

/// Errors returned by storage engines.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The engine could not be reached or the call hit a transient failure.
    /// Calls failing this way are retried with backoff.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A DDL target is already in the desired (or undesired) state, e.g. the
    /// column being added already exists.
    #[error("schema conflict on {table}.{column}: {detail}")]
    SchemaConflict {
        /// Table the DDL targeted.
        table: String,
        /// Column (or index column) the DDL targeted.
        column: String,
        /// What the engine found.
        detail: String,
    },

    /// The table does not exist.
    #[error("unknown table {0}")]
    UnknownTable(String),

    /// The column does not exist.
    #[error("unknown column {table}.{column}")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A constraint (uniqueness, NOT NULL, foreign key) rejected the change.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Anything else.
    #[error("unexpected storage error: {0}")]
    Unexpected(String),
}

impl StorageError {
    /// Whether the failing call may be retried as a whole.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    /// Shorthand for a schema conflict.
    pub fn conflict(table: &str, column: &str, detail: impl Into<String>) -> Self {
        StorageError::SchemaConflict {
            table: table.to_string(),
            column: column.to_string(),
            detail: detail.into(),
        }
    }

    /// Shorthand for an unknown column.
    pub fn unknown_column(table: &str, column: &str) -> Self {
        StorageError::UnknownColumn {
            table: table.to_string(),
            column: column.to_string(),
        }
    }
}

/// Errors raised while building or validating a [`MigrationPlan`](crate::plan::MigrationPlan).
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The plan has no tables.
    #[error("plan contains no tables")]
    Empty,

    /// A table appears twice.
    #[error("table {0} is declared more than once")]
    DuplicateTable(String),

    /// The same column is declared twice as a reference.
    #[error("reference column {table}.{column} is declared more than once")]
    DuplicateReference {
        /// Referencing table.
        table: String,
        /// Referencing column.
        column: String,
    },

    /// A shadow column reuses the name of the column it replaces, or of
    /// another planned column in the same table.
    #[error("shadow column {table}.{column} collides with another column in the plan")]
    ShadowCollision {
        /// Table name.
        table: String,
        /// Colliding column name.
        column: String,
    },

    /// A reference points at a table that is not part of the plan.
    #[error("reference {table}.{column} points at {referenced}, which is not in the plan")]
    UnknownReferencedTable {
        /// Referencing table.
        table: String,
        /// Referencing column.
        column: String,
        /// Referenced table.
        referenced: String,
    },

    /// A reference lives on a table that is not part of the plan.
    #[error("reference {table}.{column} belongs to a table that is not in the plan")]
    UnknownReferencingTable {
        /// Referencing table.
        table: String,
        /// Referencing column.
        column: String,
    },

    /// The reference graph between tables contains a cycle.
    #[error("references between tables form a cycle through {0}")]
    CyclicReferences(String),

    /// The shadow column type cannot hold generated identifiers.
    #[error("shadow column {table}.{column} must be of type uuid, got {found}")]
    UnsupportedShadowType {
        /// Table name.
        table: String,
        /// Shadow column name.
        column: String,
        /// Declared type.
        found: String,
    },

    /// A name is empty.
    #[error("empty {0} name in plan")]
    EmptyName(&'static str),

    /// The plan could not be parsed.
    #[error("invalid plan configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while running a migration.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The plan is invalid.
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),

    /// A storage call failed (after retries, if it was transient).
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Rows remain whose shadow column is NULL.
    #[error("{count} rows in {table} have no value in {column}")]
    IncompleteBackfill {
        /// Table name.
        table: String,
        /// Shadow column.
        column: String,
        /// Number of rows still NULL.
        count: u64,
    },

    /// Reference values that resolve to no row in the referenced table.
    #[error("{count} values in {table}.{column} reference missing rows")]
    OrphanedReferences {
        /// Referencing table.
        table: String,
        /// Column holding the reference.
        column: String,
        /// Number of orphaned values.
        count: u64,
    },

    /// Shadow reference values that disagree with the old reference value.
    #[error("{count} values in {table}.{column} do not match the row the old reference points at")]
    MistranslatedReferences {
        /// Referencing table.
        table: String,
        /// Shadow reference column.
        column: String,
        /// Number of mismatched rows.
        count: u64,
    },

    /// A reference was backfilled before its referenced table.
    #[error(
        "cannot translate {table}.{column}: row {key} in {referenced} is missing or has no new identifier yet"
    )]
    BackfillOrdering {
        /// Referencing table.
        table: String,
        /// Referencing column.
        column: String,
        /// Referenced table.
        referenced: String,
        /// Old key that could not be translated.
        key: String,
    },

    /// A failure during or after the swap. Never rolled back automatically.
    #[error("irreversible step failed during {phase}: {reason}")]
    IrreversibleStepFailure {
        /// Phase in which the failure occurred.
        phase: MigrationPhase,
        /// What went wrong.
        reason: String,
    },

    /// The schema shows a previous run already swapped a column into place.
    #[error("{table}.{column} has already been swapped in by a previous run")]
    AlreadySwapped {
        /// Table name.
        table: String,
        /// Column that already holds the new representation.
        column: String,
    },

    /// A planned identity or reference column has a type that cannot key a
    /// backfill batch.
    #[error("{table}.{column} is of type {found}, which cannot be used as a key")]
    UnsupportedKeyType {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// Type found in the live schema.
        found: ColumnType,
    },

    /// An abort was requested.
    #[error("migration cancelled during {0}")]
    Cancelled(MigrationPhase),

    /// The orchestrator was asked to make a transition the protocol forbids.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current phase.
        from: MigrationPhase,
        /// Requested phase.
        to: MigrationPhase,
    },
}

impl MigrationError {
    /// Returns the verification failure this error represents, if any.
    pub fn verification_failure(&self) -> Option<VerificationFailure> {
        let (kind, table, column, count) = match self {
            MigrationError::IncompleteBackfill {
                table,
                column,
                count,
            } => (VerificationKind::IncompleteBackfill, table, column, count),
            MigrationError::OrphanedReferences {
                table,
                column,
                count,
            } => (VerificationKind::OrphanedReferences, table, column, count),
            MigrationError::MistranslatedReferences {
                table,
                column,
                count,
            } => (
                VerificationKind::MistranslatedReferences,
                table,
                column,
                count,
            ),
            _ => return None,
        };
        Some(VerificationFailure {
            kind,
            table: table.clone(),
            column: column.clone(),
            count: *count,
        })
    }
}
