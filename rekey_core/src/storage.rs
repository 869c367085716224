//! Traits a storage engine implements to be migrated by the orchestrator.
//!
//! The engine owns the actual DDL and DML. The core never builds SQL; it asks
//! for one schema change, one batch read or one batch write at a time, so
//! every call is a unit that either fully applies or fails.

use crate::error::StorageError;
use crate::value::{ColumnDef, TargetTable, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

/// Schema changes, one DDL statement per call.
///
/// Adding a column that exists, or dropping, renaming or un-indexing one that
/// doesn't, returns [`StorageError::SchemaConflict`] instead of succeeding
/// silently. Implementations must not rely on DDL being rolled back; once a
/// call returns `Ok` its effect is durable.
#[async_trait]
pub trait SchemaMutator: Send + Sync {
    /// Describes the current columns of `table`.
    async fn describe_table(&self, table: &str) -> Result<TargetTable, StorageError>;

    /// Adds a column.
    async fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StorageError>;

    /// Drops a column together with the indexes and constraints on it.
    async fn drop_column(&self, table: &str, column: &str) -> Result<(), StorageError>;

    /// Renames a column.
    async fn rename_column(&self, table: &str, from: &str, to: &str) -> Result<(), StorageError>;

    /// Adds a unique index on a single column.
    async fn add_unique_index(&self, table: &str, column: &str) -> Result<(), StorageError>;

    /// Drops the unique index created by [`add_unique_index`](Self::add_unique_index)
    /// for the same table and column name.
    async fn drop_index(&self, table: &str, column: &str) -> Result<(), StorageError>;

    /// Makes `column` the primary key of `table`.
    async fn add_primary_key(&self, table: &str, column: &str) -> Result<(), StorageError>;

    /// Adds a foreign key from `table.column` to `ref_table.ref_column`.
    async fn add_foreign_key(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<(), StorageError>;

    /// Adds a NOT NULL constraint.
    async fn set_not_null(&self, table: &str, column: &str) -> Result<(), StorageError>;
}

/// Selects rows still waiting for a shadow value.
#[derive(Debug, Clone)]
pub struct PendingQuery<'a> {
    /// Table to scan.
    pub table: &'a str,
    /// Stable ordering key, the table's current primary key.
    pub key_column: &'a str,
    /// Column whose value is handed back with each row: the creation
    /// timestamp for identities, the old reference value for references.
    pub source_column: Option<&'a str>,
    /// Shadow column being filled.
    pub shadow_column: &'a str,
    /// Skip rows whose source value is NULL.
    pub require_source: bool,
    /// Exclusive lower bound on the key.
    pub after: Option<&'a Value>,
    /// Maximum number of rows.
    pub limit: usize,
}

/// A row returned by [`BackfillSource::fetch_pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRow {
    /// The row's current key.
    pub key: Value,
    /// The source column value, or NULL when no source column was asked for.
    pub source: Value,
}

/// Batched reads and writes used by the backfill driver.
#[async_trait]
pub trait BackfillSource: Send + Sync {
    /// Returns up to `query.limit` rows whose shadow column is NULL, ordered
    /// by key ascending.
    async fn fetch_pending(
        &self,
        query: &PendingQuery<'_>,
    ) -> Result<Vec<PendingRow>, StorageError>;

    /// Returns the non-null shadow values for the given keys.
    async fn lookup_shadow(
        &self,
        table: &str,
        key_column: &str,
        shadow_column: &str,
        keys: &[Value],
    ) -> Result<HashMap<Value, Uuid>, StorageError>;

    /// Writes shadow values in a single committed transaction. Rows whose
    /// shadow column is already set are left untouched. Returns the number
    /// of rows written.
    async fn write_shadow(
        &self,
        table: &str,
        key_column: &str,
        shadow_column: &str,
        updates: &[(Value, Uuid)],
    ) -> Result<u64, StorageError>;
}

/// Identifies a reference column and everything needed to translate it.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceTranslation<'a> {
    /// Referencing table.
    pub table: &'a str,
    /// Referencing table's key column.
    pub key_column: &'a str,
    /// Old reference column.
    pub column: &'a str,
    /// Shadow reference column.
    pub shadow_column: &'a str,
    /// Referenced table.
    pub referenced_table: &'a str,
    /// Referenced table's old identity column.
    pub referenced_key: &'a str,
    /// Referenced table's shadow identity column.
    pub referenced_shadow: &'a str,
}

/// Read-only counting queries used by the consistency verifier.
#[async_trait]
pub trait ConsistencyQueries: Send + Sync {
    /// Counts rows whose `shadow_column` is NULL. With a `source_column`,
    /// only rows whose source value is not NULL are counted.
    async fn count_missing(
        &self,
        table: &str,
        shadow_column: &str,
        source_column: Option<&str>,
    ) -> Result<u64, StorageError>;

    /// Counts non-null `table.column` values with no row in `ref_table`
    /// whose `ref_column` equals them.
    async fn count_orphans(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<u64, StorageError>;

    /// Counts rows whose shadow reference is set but differs from the shadow
    /// identity of the row the old reference points at.
    async fn count_mistranslated(
        &self,
        reference: &ReferenceTranslation<'_>,
    ) -> Result<u64, StorageError>;
}

/// What an engine can promise about DDL atomicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// DDL on several tables can run inside one transaction that commits or
    /// rolls back as a whole. Without it, each table is swapped in its own
    /// boundary.
    pub multi_table_ddl_transactions: bool,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            multi_table_ddl_transactions: true,
        }
    }
}

/// The atomic boundary in which old columns are dropped and shadows renamed.
///
/// Changes made through the boundary, shadow writes included, become visible
/// on [`commit`](Self::commit). Dropping a boundary without committing must
/// discard its changes.
#[async_trait]
pub trait SwapBoundary: SchemaMutator + BackfillSource + ConsistencyQueries {
    /// Blocks concurrent writers to the tables until the boundary ends.
    async fn lock_tables(&self, tables: &[&str]) -> Result<(), StorageError>;

    /// Makes every change permanent.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discards every change.
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// A storage engine the orchestrator can migrate.
#[async_trait]
pub trait StorageEngine: SchemaMutator + BackfillSource + ConsistencyQueries {
    /// The engine's DDL transaction guarantees.
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }

    /// Opens a swap boundary.
    async fn begin_swap(&self) -> Result<Box<dyn SwapBoundary + '_>, StorageError>;
}
