//! # Rekey
//!
//! Online replacement of integer identity columns with time-ordered UUIDs.
//!
//! A migration adds a shadow column next to every identity and reference
//! column in a [`plan::MigrationPlan`], backfills it in small batches while
//! the application keeps writing, verifies the result and finally swaps the
//! shadows into place. The storage engine is abstracted behind the traits in
//! [`storage`]; see `rekey_mem` and `rekey_pg` for implementations.

#![deny(missing_docs)]

pub mod backfill;
pub mod cancel;
pub mod config;
pub mod error;
pub mod identifier;
pub mod orchestrator;
pub mod phase;
pub mod plan;
pub mod report;
pub mod retry;
pub mod storage;
pub mod value;
pub mod verify;

pub mod prelude {
    //! The prelude module for the `rekey_core` crate.
    pub use super::backfill::{BackfillCursor, BackfillDriver, BackfillTarget, CursorStore};
    pub use super::cancel::AbortHandle;
    pub use super::config::{MigrationConfig, RetryConfig};
    pub use super::error::{MigrationError, PlanError, StorageError};
    pub use super::identifier::{IdentifierGenerator, TimeOrderedGenerator};
    pub use super::orchestrator::{MigrationRun, Orchestrator};
    pub use super::phase::MigrationPhase;
    pub use super::plan::{MigrationPlan, MigrationPlanBuilder, ReferenceColumn, TablePlan};
    pub use super::report::{
        MigrationJournal, MigrationReport, VerificationFailure, VerificationKind,
    };
    pub use super::storage::{
        BackfillSource, ConsistencyQueries, EngineCapabilities, PendingQuery, PendingRow,
        ReferenceTranslation, SchemaMutator, StorageEngine, SwapBoundary,
    };
    pub use super::value::{ColumnDef, ColumnType, TargetTable, Value};
    pub use super::verify::ConsistencyVerifier;
}
