//! The in-memory engine and its swap boundary.
//!
//! Every [`InMemoryEngine`] call first passes through a set of interceptors:
//! a per-operation call counter, injected failures registered with
//! [`InMemoryEngine::fail`], and hooks registered with [`InMemoryEngine::on`].
//! Tests use them to simulate outages and concurrent application writes at
//! exact points of a migration.

use crate::database::{Database, Row};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use rekey_core::prelude::*;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Engine calls that can be intercepted with [`InMemoryEngine::fail`] and
/// [`InMemoryEngine::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`SchemaMutator::describe_table`]
    DescribeTable,
    /// [`SchemaMutator::add_column`]
    AddColumn,
    /// [`SchemaMutator::drop_column`]
    DropColumn,
    /// [`SchemaMutator::rename_column`]
    RenameColumn,
    /// [`SchemaMutator::add_unique_index`]
    AddUniqueIndex,
    /// [`SchemaMutator::drop_index`]
    DropIndex,
    /// [`SchemaMutator::add_primary_key`]
    AddPrimaryKey,
    /// [`SchemaMutator::add_foreign_key`]
    AddForeignKey,
    /// [`SchemaMutator::set_not_null`]
    SetNotNull,
    /// [`BackfillSource::fetch_pending`]
    FetchPending,
    /// [`BackfillSource::lookup_shadow`]
    LookupShadow,
    /// [`BackfillSource::write_shadow`]
    WriteShadow,
    /// [`ConsistencyQueries::count_missing`]
    CountMissing,
    /// [`ConsistencyQueries::count_orphans`]
    CountOrphans,
    /// [`ConsistencyQueries::count_mistranslated`]
    CountMistranslated,
    /// [`StorageEngine::begin_swap`]
    BeginSwap,
    /// [`SwapBoundary::lock_tables`]
    LockTables,
    /// [`SwapBoundary::commit`]
    Commit,
}

#[derive(Debug)]
struct Fault {
    operation: Operation,
    skip: usize,
    remaining: usize,
    error: StorageError,
}

type Hook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Interceptors {
    faults: Vec<Fault>,
    hooks: HashMap<Operation, Vec<Hook>>,
    calls: HashMap<Operation, usize>,
}

impl Interceptors {
    /// Records the call and returns the hooks to run along with the injected
    /// failure, if any.
    fn intercept(&mut self, operation: Operation) -> (Vec<Hook>, Result<(), StorageError>) {
        *self.calls.entry(operation).or_default() += 1;
        let hooks = self.hooks.get(&operation).cloned().unwrap_or_default();
        let Some(fault) = self
            .faults
            .iter_mut()
            .find(|f| f.operation == operation && f.remaining > 0)
        else {
            return (hooks, Ok(()));
        };
        if fault.skip > 0 {
            fault.skip -= 1;
            return (hooks, Ok(()));
        }
        fault.remaining -= 1;
        log::debug!("Injecting failure into {:?}: {}", operation, fault.error);
        (hooks, Err(fault.error.clone()))
    }
}

/// Runs the interceptors for one call. Hooks run after the lock is released
/// so they may call back into the engine.
async fn intercept(
    interceptors: &StdMutex<Interceptors>,
    operation: Operation,
) -> Result<(), StorageError> {
    let (hooks, outcome) = interceptors
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .intercept(operation);
    for hook in hooks {
        hook().await;
    }
    outcome
}

/// An in-memory relational store implementing [`StorageEngine`].
///
/// Tables enforce types, NOT NULL, primary keys, unique indexes and foreign
/// keys, and DDL behaves like a transactional SQL database. Useful for tests
/// and for rehearsing a plan; nothing is persisted.
#[derive(Clone)]
pub struct InMemoryEngine {
    db: Arc<Mutex<Database>>,
    interceptors: Arc<StdMutex<Interceptors>>,
    capabilities: EngineCapabilities,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEngine")
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl InMemoryEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryEngine");
        Self {
            db: Arc::new(Mutex::new(Database::default())),
            interceptors: Arc::new(StdMutex::new(Interceptors::default())),
            capabilities: EngineCapabilities::default(),
        }
    }

    /// Overrides the advertised capabilities.
    pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Makes the next `times` calls to `operation` fail with `error`, after
    /// letting `skip` calls through.
    pub fn fail(&self, operation: Operation, skip: usize, times: usize, error: StorageError) {
        self.interceptors().faults.push(Fault {
            operation,
            skip,
            remaining: times,
            error,
        });
    }

    /// Runs `hook` whenever `operation` is called, before it executes.
    ///
    /// # Arguments
    /// * `operation` - The engine call to watch.
    /// * `hook` - Produces a future that is awaited before the call runs.
    ///   The engine is not locked at that point, so the hook may read or
    ///   write through a clone of the engine. Hooks on calls made through an
    ///   open swap boundary must not write: the boundary holds the database
    ///   until it ends.
    pub fn on<F, Fut>(&self, operation: Operation, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.interceptors()
            .hooks
            .entry(operation)
            .or_default()
            .push(Arc::new(move || hook().boxed()));
    }

    /// How many times `operation` has been called, including failed calls.
    pub fn calls(&self, operation: Operation) -> usize {
        self.interceptors()
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Creates a table.
    pub async fn create_table(
        &self,
        name: &str,
        columns: Vec<ColumnDef>,
    ) -> Result<(), StorageError> {
        self.db.lock().await.create_table(name, columns)
    }

    /// Inserts a row. Missing columns take their default or NULL.
    pub async fn insert<K, V>(
        &self,
        table: &str,
        values: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), StorageError>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let row: Row = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.db.lock().await.insert(table, row)
    }

    /// Sets `column` on the rows whose `key_column` equals `key`.
    pub async fn update(
        &self,
        table: &str,
        key_column: &str,
        key: impl Into<Value>,
        column: &str,
        value: impl Into<Value>,
    ) -> Result<u64, StorageError> {
        self.db
            .lock()
            .await
            .update(table, key_column, &key.into(), column, value.into())
    }

    /// Deletes the rows whose `key_column` equals `key`.
    pub async fn delete(
        &self,
        table: &str,
        key_column: &str,
        key: impl Into<Value>,
    ) -> Result<u64, StorageError> {
        self.db.lock().await.delete(table, key_column, &key.into())
    }

    /// All rows of `table` in insertion order.
    pub async fn rows(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        self.db.lock().await.rows(table)
    }

    /// The first row whose `column` equals `value`.
    pub async fn find_by(
        &self,
        table: &str,
        column: &str,
        value: impl Into<Value>,
    ) -> Result<Option<Row>, StorageError> {
        let value = value.into();
        Ok(self
            .rows(table)
            .await?
            .into_iter()
            .find(|row| row.get(column) == Some(&value)))
    }

    fn interceptors(&self) -> std::sync::MutexGuard<'_, Interceptors> {
        self.interceptors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn intercept(&self, operation: Operation) -> Result<(), StorageError> {
        intercept(&self.interceptors, operation).await
    }
}

#[async_trait]
impl SchemaMutator for InMemoryEngine {
    async fn describe_table(&self, table: &str) -> Result<TargetTable, StorageError> {
        self.intercept(Operation::DescribeTable).await?;
        self.db.lock().await.describe_table(table)
    }

    async fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StorageError> {
        self.intercept(Operation::AddColumn).await?;
        log::debug!("ADD COLUMN {}.{} {}", table, column.name, column.column_type);
        self.db.lock().await.add_column(table, column)
    }

    async fn drop_column(&self, table: &str, column: &str) -> Result<(), StorageError> {
        self.intercept(Operation::DropColumn).await?;
        log::debug!("DROP COLUMN {}.{}", table, column);
        self.db.lock().await.drop_column(table, column)
    }

    async fn rename_column(&self, table: &str, from: &str, to: &str) -> Result<(), StorageError> {
        self.intercept(Operation::RenameColumn).await?;
        self.db.lock().await.rename_column(table, from, to)
    }

    async fn add_unique_index(&self, table: &str, column: &str) -> Result<(), StorageError> {
        self.intercept(Operation::AddUniqueIndex).await?;
        self.db.lock().await.add_unique_index(table, column)
    }

    async fn drop_index(&self, table: &str, column: &str) -> Result<(), StorageError> {
        self.intercept(Operation::DropIndex).await?;
        self.db.lock().await.drop_index(table, column)
    }

    async fn add_primary_key(&self, table: &str, column: &str) -> Result<(), StorageError> {
        self.intercept(Operation::AddPrimaryKey).await?;
        self.db.lock().await.add_primary_key(table, column)
    }

    async fn add_foreign_key(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<(), StorageError> {
        self.intercept(Operation::AddForeignKey).await?;
        self.db
            .lock()
            .await
            .add_foreign_key(table, column, ref_table, ref_column)
    }

    async fn set_not_null(&self, table: &str, column: &str) -> Result<(), StorageError> {
        self.intercept(Operation::SetNotNull).await?;
        self.db.lock().await.set_not_null(table, column)
    }
}

#[async_trait]
impl BackfillSource for InMemoryEngine {
    async fn fetch_pending(
        &self,
        query: &PendingQuery<'_>,
    ) -> Result<Vec<PendingRow>, StorageError> {
        self.intercept(Operation::FetchPending).await?;
        self.db.lock().await.fetch_pending(query)
    }

    async fn lookup_shadow(
        &self,
        table: &str,
        key_column: &str,
        shadow_column: &str,
        keys: &[Value],
    ) -> Result<HashMap<Value, Uuid>, StorageError> {
        self.intercept(Operation::LookupShadow).await?;
        self.db
            .lock()
            .await
            .lookup_shadow(table, key_column, shadow_column, keys)
    }

    async fn write_shadow(
        &self,
        table: &str,
        key_column: &str,
        shadow_column: &str,
        updates: &[(Value, Uuid)],
    ) -> Result<u64, StorageError> {
        self.intercept(Operation::WriteShadow).await?;
        self.db
            .lock()
            .await
            .write_shadow(table, key_column, shadow_column, updates)
    }
}

#[async_trait]
impl ConsistencyQueries for InMemoryEngine {
    async fn count_missing(
        &self,
        table: &str,
        shadow_column: &str,
        source_column: Option<&str>,
    ) -> Result<u64, StorageError> {
        self.intercept(Operation::CountMissing).await?;
        self.db
            .lock()
            .await
            .count_missing(table, shadow_column, source_column)
    }

    async fn count_orphans(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<u64, StorageError> {
        self.intercept(Operation::CountOrphans).await?;
        self.db
            .lock()
            .await
            .orphans(table, column, ref_table, ref_column)
    }

    async fn count_mistranslated(
        &self,
        reference: &ReferenceTranslation<'_>,
    ) -> Result<u64, StorageError> {
        self.intercept(Operation::CountMistranslated).await?;
        self.db.lock().await.count_mistranslated(reference)
    }
}

#[async_trait]
impl StorageEngine for InMemoryEngine {
    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    async fn begin_swap(&self) -> Result<Box<dyn SwapBoundary + '_>, StorageError> {
        self.intercept(Operation::BeginSwap).await?;
        let guard = self.db.clone().lock_owned().await;
        let staged = (*guard).clone();
        log::debug!("Swap boundary opened");
        Ok(Box::new(InMemorySwap {
            staged: Mutex::new(staged),
            guard,
            interceptors: self.interceptors.clone(),
        }))
    }
}

/// A swap boundary over an [`InMemoryEngine`].
///
/// The whole database stays locked while the boundary is open, so every
/// table counts as locked. Changes are applied to a private copy that
/// replaces the database on commit.
pub struct InMemorySwap {
    staged: Mutex<Database>,
    guard: OwnedMutexGuard<Database>,
    interceptors: Arc<StdMutex<Interceptors>>,
}

impl InMemorySwap {
    async fn intercept(&self, operation: Operation) -> Result<(), StorageError> {
        intercept(&self.interceptors, operation).await
    }
}

#[async_trait]
impl SchemaMutator for InMemorySwap {
    async fn describe_table(&self, table: &str) -> Result<TargetTable, StorageError> {
        self.intercept(Operation::DescribeTable).await?;
        self.staged.lock().await.describe_table(table)
    }

    async fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StorageError> {
        self.intercept(Operation::AddColumn).await?;
        self.staged.lock().await.add_column(table, column)
    }

    async fn drop_column(&self, table: &str, column: &str) -> Result<(), StorageError> {
        self.intercept(Operation::DropColumn).await?;
        log::debug!("DROP COLUMN {}.{} (staged)", table, column);
        self.staged.lock().await.drop_column(table, column)
    }

    async fn rename_column(&self, table: &str, from: &str, to: &str) -> Result<(), StorageError> {
        self.intercept(Operation::RenameColumn).await?;
        log::debug!("RENAME COLUMN {}.{} TO {} (staged)", table, from, to);
        self.staged.lock().await.rename_column(table, from, to)
    }

    async fn add_unique_index(&self, table: &str, column: &str) -> Result<(), StorageError> {
        self.intercept(Operation::AddUniqueIndex).await?;
        self.staged.lock().await.add_unique_index(table, column)
    }

    async fn drop_index(&self, table: &str, column: &str) -> Result<(), StorageError> {
        self.intercept(Operation::DropIndex).await?;
        self.staged.lock().await.drop_index(table, column)
    }

    async fn add_primary_key(&self, table: &str, column: &str) -> Result<(), StorageError> {
        self.intercept(Operation::AddPrimaryKey).await?;
        self.staged.lock().await.add_primary_key(table, column)
    }

    async fn add_foreign_key(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<(), StorageError> {
        self.intercept(Operation::AddForeignKey).await?;
        self.staged
            .lock()
            .await
            .add_foreign_key(table, column, ref_table, ref_column)
    }

    async fn set_not_null(&self, table: &str, column: &str) -> Result<(), StorageError> {
        self.intercept(Operation::SetNotNull).await?;
        self.staged.lock().await.set_not_null(table, column)
    }
}

#[async_trait]
impl BackfillSource for InMemorySwap {
    async fn fetch_pending(
        &self,
        query: &PendingQuery<'_>,
    ) -> Result<Vec<PendingRow>, StorageError> {
        self.intercept(Operation::FetchPending).await?;
        self.staged.lock().await.fetch_pending(query)
    }

    async fn lookup_shadow(
        &self,
        table: &str,
        key_column: &str,
        shadow_column: &str,
        keys: &[Value],
    ) -> Result<HashMap<Value, Uuid>, StorageError> {
        self.intercept(Operation::LookupShadow).await?;
        self.staged
            .lock()
            .await
            .lookup_shadow(table, key_column, shadow_column, keys)
    }

    async fn write_shadow(
        &self,
        table: &str,
        key_column: &str,
        shadow_column: &str,
        updates: &[(Value, Uuid)],
    ) -> Result<u64, StorageError> {
        self.intercept(Operation::WriteShadow).await?;
        log::debug!("Staged {} shadow values for {}.{}", updates.len(), table, shadow_column);
        self.staged
            .lock()
            .await
            .write_shadow(table, key_column, shadow_column, updates)
    }
}

#[async_trait]
impl ConsistencyQueries for InMemorySwap {
    async fn count_missing(
        &self,
        table: &str,
        shadow_column: &str,
        source_column: Option<&str>,
    ) -> Result<u64, StorageError> {
        self.intercept(Operation::CountMissing).await?;
        self.staged
            .lock()
            .await
            .count_missing(table, shadow_column, source_column)
    }

    async fn count_orphans(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<u64, StorageError> {
        self.intercept(Operation::CountOrphans).await?;
        self.staged
            .lock()
            .await
            .orphans(table, column, ref_table, ref_column)
    }

    async fn count_mistranslated(
        &self,
        reference: &ReferenceTranslation<'_>,
    ) -> Result<u64, StorageError> {
        self.intercept(Operation::CountMistranslated).await?;
        self.staged.lock().await.count_mistranslated(reference)
    }
}

#[async_trait]
impl SwapBoundary for InMemorySwap {
    async fn lock_tables(&self, tables: &[&str]) -> Result<(), StorageError> {
        self.intercept(Operation::LockTables).await?;
        let staged = self.staged.lock().await;
        for table in tables {
            staged.describe_table(table)?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.intercept(Operation::Commit).await?;
        let InMemorySwap { staged, mut guard, .. } = *self;
        *guard = staged.into_inner();
        log::debug!("Swap boundary committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        log::debug!("Swap boundary rolled back");
        Ok(())
    }
}
