//! # Rekey postgres engine
//!
//! Runs rekey migrations against PostgreSQL through sqlx.

#![deny(missing_docs)]

/// Persistent backfill cursors.
pub mod cursor_store;

/// The storage engine and its swap transaction.
pub mod engine;

/// Mapping of sqlx errors onto storage errors.
pub mod error;

/// Persistent run reports.
pub mod journal;

/// Bookkeeping table migrations for rekey_pg.
pub mod migrations;

mod ops;

/// SQL text helpers and value conversions.
pub mod sql;

pub use cursor_store::PgCursorStore;
pub use engine::{PgEngine, PgSwapBoundary};
pub use journal::{PgMigrationJournal, plan_checksum};
pub use migrations::{AppliedMigration, Migration, MigrationError, Migrator};
