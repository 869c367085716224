//! [`StorageEngine`] over a Postgres pool.

use crate::error::{connection_error, storage_error};
use crate::ops;
use async_trait::async_trait;
use rekey_core::prelude::*;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Migrates tables of one Postgres schema.
///
/// Backfill batches and shadow column DDL run in autocommit mode on pooled
/// connections; unique indexes on shadow columns are built concurrently so
/// writers are not blocked. The swap runs in a single transaction, which
/// Postgres can roll back even after DDL.
#[derive(Debug, Clone)]
pub struct PgEngine {
    pool: PgPool,
    schema: String,
    lock_timeout: Option<Duration>,
    capabilities: EngineCapabilities,
}

impl PgEngine {
    /// Creates an engine for tables in the `public` schema.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
            lock_timeout: None,
            capabilities: EngineCapabilities::default(),
        }
    }

    /// Targets tables in `schema`.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Bounds how long the swap waits for table locks. A timeout surfaces as
    /// a transient error, so the orchestrator retries the swap.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Overrides the reported capabilities, e.g. to swap one table per
    /// transaction and keep each lock short.
    pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The schema the engine targets.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    async fn conn(&self) -> Result<PoolConnection<Postgres>, StorageError> {
        self.pool.acquire().await.map_err(connection_error)
    }
}

#[async_trait]
impl SchemaMutator for PgEngine {
    async fn describe_table(&self, table: &str) -> Result<TargetTable, StorageError> {
        ops::describe_table(&mut *self.conn().await?, &self.schema, table).await
    }

    async fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StorageError> {
        ops::add_column(&mut *self.conn().await?, &self.schema, table, column).await
    }

    async fn drop_column(&self, table: &str, column: &str) -> Result<(), StorageError> {
        ops::drop_column(&mut *self.conn().await?, &self.schema, table, column).await
    }

    async fn rename_column(&self, table: &str, from: &str, to: &str) -> Result<(), StorageError> {
        ops::rename_column(&mut *self.conn().await?, &self.schema, table, from, to).await
    }

    async fn add_unique_index(&self, table: &str, column: &str) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        match ops::add_unique_index(&mut conn, &self.schema, table, column, true).await {
            Err(e) if !matches!(e, StorageError::SchemaConflict { .. }) => {
                if let Err(cleanup) =
                    ops::drop_leftover_index(&mut conn, &self.schema, table, column).await
                {
                    log::warn!(
                        "Could not drop invalid index on {}.{}: {}",
                        table,
                        column,
                        cleanup
                    );
                }
                Err(e)
            }
            result => result,
        }
    }

    async fn drop_index(&self, table: &str, column: &str) -> Result<(), StorageError> {
        ops::drop_index(&mut *self.conn().await?, &self.schema, table, column).await
    }

    async fn add_primary_key(&self, table: &str, column: &str) -> Result<(), StorageError> {
        ops::add_primary_key(&mut *self.conn().await?, &self.schema, table, column).await
    }

    async fn add_foreign_key(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        ops::add_foreign_key(&mut conn, &self.schema, table, column, ref_table, ref_column).await
    }

    async fn set_not_null(&self, table: &str, column: &str) -> Result<(), StorageError> {
        ops::set_not_null(&mut *self.conn().await?, &self.schema, table, column).await
    }
}

#[async_trait]
impl BackfillSource for PgEngine {
    async fn fetch_pending(
        &self,
        query: &PendingQuery<'_>,
    ) -> Result<Vec<PendingRow>, StorageError> {
        ops::fetch_pending(&mut *self.conn().await?, &self.schema, query).await
    }

    async fn lookup_shadow(
        &self,
        table: &str,
        key_column: &str,
        shadow_column: &str,
        keys: &[Value],
    ) -> Result<HashMap<Value, Uuid>, StorageError> {
        let mut conn = self.conn().await?;
        ops::lookup_shadow(&mut conn, &self.schema, table, key_column, shadow_column, keys).await
    }

    async fn write_shadow(
        &self,
        table: &str,
        key_column: &str,
        shadow_column: &str,
        updates: &[(Value, Uuid)],
    ) -> Result<u64, StorageError> {
        let mut conn = self.conn().await?;
        ops::write_shadow(&mut conn, &self.schema, table, key_column, shadow_column, updates).await
    }
}

#[async_trait]
impl ConsistencyQueries for PgEngine {
    async fn count_missing(
        &self,
        table: &str,
        shadow_column: &str,
        source_column: Option<&str>,
    ) -> Result<u64, StorageError> {
        let mut conn = self.conn().await?;
        ops::count_missing(&mut conn, &self.schema, table, shadow_column, source_column).await
    }

    async fn count_orphans(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<u64, StorageError> {
        let mut conn = self.conn().await?;
        ops::count_orphans(&mut conn, &self.schema, table, column, ref_table, ref_column).await
    }

    async fn count_mistranslated(
        &self,
        reference: &ReferenceTranslation<'_>,
    ) -> Result<u64, StorageError> {
        ops::count_mistranslated(&mut *self.conn().await?, &self.schema, reference).await
    }
}

#[async_trait]
impl StorageEngine for PgEngine {
    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    async fn begin_swap(&self) -> Result<Box<dyn SwapBoundary + '_>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(connection_error)?;
        if let Some(timeout) = self.lock_timeout {
            let sql = format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis());
            sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| storage_error(e, "", ""))?;
        }
        Ok(Box::new(PgSwapBoundary {
            tx: Mutex::new(tx),
            schema: self.schema.clone(),
        }))
    }
}

/// The swap transaction. Dropping it without committing rolls back.
pub struct PgSwapBoundary {
    tx: Mutex<Transaction<'static, Postgres>>,
    schema: String,
}

#[async_trait]
impl SchemaMutator for PgSwapBoundary {
    async fn describe_table(&self, table: &str) -> Result<TargetTable, StorageError> {
        ops::describe_table(&mut **self.tx.lock().await, &self.schema, table).await
    }

    async fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StorageError> {
        ops::add_column(&mut **self.tx.lock().await, &self.schema, table, column).await
    }

    async fn drop_column(&self, table: &str, column: &str) -> Result<(), StorageError> {
        ops::drop_column(&mut **self.tx.lock().await, &self.schema, table, column).await
    }

    async fn rename_column(&self, table: &str, from: &str, to: &str) -> Result<(), StorageError> {
        let mut tx = self.tx.lock().await;
        ops::rename_column(&mut tx, &self.schema, table, from, to).await
    }

    async fn add_unique_index(&self, table: &str, column: &str) -> Result<(), StorageError> {
        let mut tx = self.tx.lock().await;
        ops::add_unique_index(&mut tx, &self.schema, table, column, false).await
    }

    async fn drop_index(&self, table: &str, column: &str) -> Result<(), StorageError> {
        ops::drop_index(&mut **self.tx.lock().await, &self.schema, table, column).await
    }

    async fn add_primary_key(&self, table: &str, column: &str) -> Result<(), StorageError> {
        ops::add_primary_key(&mut **self.tx.lock().await, &self.schema, table, column).await
    }

    async fn add_foreign_key(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<(), StorageError> {
        let mut tx = self.tx.lock().await;
        ops::add_foreign_key(&mut tx, &self.schema, table, column, ref_table, ref_column).await
    }

    async fn set_not_null(&self, table: &str, column: &str) -> Result<(), StorageError> {
        ops::set_not_null(&mut **self.tx.lock().await, &self.schema, table, column).await
    }
}

#[async_trait]
impl BackfillSource for PgSwapBoundary {
    async fn fetch_pending(
        &self,
        query: &PendingQuery<'_>,
    ) -> Result<Vec<PendingRow>, StorageError> {
        ops::fetch_pending(&mut **self.tx.lock().await, &self.schema, query).await
    }

    async fn lookup_shadow(
        &self,
        table: &str,
        key_column: &str,
        shadow_column: &str,
        keys: &[Value],
    ) -> Result<HashMap<Value, Uuid>, StorageError> {
        let mut tx = self.tx.lock().await;
        ops::lookup_shadow(&mut tx, &self.schema, table, key_column, shadow_column, keys).await
    }

    /// Writes inside the swap transaction; nothing is visible until commit.
    async fn write_shadow(
        &self,
        table: &str,
        key_column: &str,
        shadow_column: &str,
        updates: &[(Value, Uuid)],
    ) -> Result<u64, StorageError> {
        let mut tx = self.tx.lock().await;
        ops::write_shadow(&mut tx, &self.schema, table, key_column, shadow_column, updates).await
    }
}

#[async_trait]
impl ConsistencyQueries for PgSwapBoundary {
    async fn count_missing(
        &self,
        table: &str,
        shadow_column: &str,
        source_column: Option<&str>,
    ) -> Result<u64, StorageError> {
        let mut tx = self.tx.lock().await;
        ops::count_missing(&mut tx, &self.schema, table, shadow_column, source_column).await
    }

    async fn count_orphans(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<u64, StorageError> {
        let mut tx = self.tx.lock().await;
        ops::count_orphans(&mut tx, &self.schema, table, column, ref_table, ref_column).await
    }

    async fn count_mistranslated(
        &self,
        reference: &ReferenceTranslation<'_>,
    ) -> Result<u64, StorageError> {
        ops::count_mistranslated(&mut **self.tx.lock().await, &self.schema, reference).await
    }
}

#[async_trait]
impl SwapBoundary for PgSwapBoundary {
    async fn lock_tables(&self, tables: &[&str]) -> Result<(), StorageError> {
        ops::lock_tables(&mut **self.tx.lock().await, &self.schema, tables).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx
            .into_inner()
            .commit()
            .await
            .map_err(|e| storage_error(e, "", ""))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx
            .into_inner()
            .rollback()
            .await
            .map_err(|e| storage_error(e, "", ""))
    }
}
