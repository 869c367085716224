//! Batched population of shadow columns.
//!
//! The driver walks a table by key ascending, `batch_size` rows at a time,
//! and only ever sees rows whose shadow column is still NULL. Each batch is
//! written in its own transaction and the engine never overwrites a shadow
//! value that is already set. An interrupted backfill can therefore simply be
//! started again: already written rows are skipped and keep their values.

use crate::cancel::AbortHandle;
use crate::config::RetryConfig;
use crate::error::{MigrationError, StorageError};
use crate::identifier::IdentifierGenerator;
use crate::phase::MigrationPhase;
use crate::plan::{ReferenceColumn, TablePlan};
use crate::retry::retry_transient;
use crate::storage::{BackfillSource, PendingQuery, PendingRow};
use crate::value::Value;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// What a backfill fills in.
#[derive(Debug, Clone, Copy)]
pub enum BackfillTarget<'a> {
    /// A table's shadow identity column, filled with fresh identifiers.
    Identity(&'a TablePlan),
    /// A shadow reference column, filled with the referenced rows' shadow
    /// identities.
    Reference {
        /// The reference being translated.
        reference: &'a ReferenceColumn,
        /// The plan of the table holding the reference.
        owner: &'a TablePlan,
        /// The plan of the referenced table.
        referenced: &'a TablePlan,
    },
}

impl BackfillTarget<'_> {
    /// Table being written.
    pub fn table(&self) -> &str {
        match self {
            BackfillTarget::Identity(plan) => &plan.table,
            BackfillTarget::Reference { reference, .. } => &reference.table,
        }
    }

    /// Shadow column being written.
    pub fn shadow_column(&self) -> &str {
        match self {
            BackfillTarget::Identity(plan) => &plan.shadow_column,
            BackfillTarget::Reference { reference, .. } => &reference.shadow_column,
        }
    }

    /// Column the rows are ordered by.
    pub fn key_column(&self) -> &str {
        match self {
            BackfillTarget::Identity(plan) => &plan.identity_column,
            BackfillTarget::Reference { owner, .. } => &owner.identity_column,
        }
    }

    /// `table.shadow_column`, used in logs and reports.
    pub fn label(&self) -> String {
        format!("{}.{}", self.table(), self.shadow_column())
    }

    fn pending_query<'q>(&'q self, after: Option<&'q Value>, limit: usize) -> PendingQuery<'q> {
        match self {
            BackfillTarget::Identity(plan) => PendingQuery {
                table: &plan.table,
                key_column: &plan.identity_column,
                source_column: plan.created_at_column.as_deref(),
                shadow_column: &plan.shadow_column,
                require_source: false,
                after,
                limit,
            },
            BackfillTarget::Reference {
                reference, owner, ..
            } => PendingQuery {
                table: &reference.table,
                key_column: &owner.identity_column,
                source_column: Some(&reference.column),
                shadow_column: &reference.shadow_column,
                require_source: true,
                after,
                limit,
            },
        }
    }
}

/// Progress of a backfill: the last key written and how many rows were seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillCursor {
    /// Table being backfilled.
    pub table: String,
    /// Shadow column being backfilled.
    pub shadow_column: String,
    /// Highest key processed so far.
    pub last_key: Option<Value>,
    /// Rows processed so far.
    pub rows_processed: u64,
}

impl BackfillCursor {
    fn start(target: &BackfillTarget<'_>) -> Self {
        Self {
            table: target.table().to_string(),
            shadow_column: target.shadow_column().to_string(),
            last_key: None,
            rows_processed: 0,
        }
    }
}

/// Optional durable home for [`BackfillCursor`]s.
///
/// A stored cursor lets a restarted process skip key ranges it already
/// scanned. Correctness never depends on it since only NULL shadow values are
/// ever written.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Loads the cursor for a shadow column.
    async fn load(
        &self,
        table: &str,
        shadow_column: &str,
    ) -> Result<Option<BackfillCursor>, StorageError>;

    /// Saves a cursor, replacing any previous one.
    async fn save(&self, cursor: &BackfillCursor) -> Result<(), StorageError>;

    /// Forgets the cursor for a shadow column.
    async fn clear(&self, table: &str, shadow_column: &str) -> Result<(), StorageError>;
}

/// Populates shadow columns in batches.
pub struct BackfillDriver<'a, S: ?Sized> {
    source: &'a S,
    generator: &'a dyn IdentifierGenerator,
    retry: RetryConfig,
    cursors: Option<&'a dyn CursorStore>,
    abort: Option<AbortHandle>,
}

impl<'a, S> BackfillDriver<'a, S>
where
    S: BackfillSource + ?Sized,
{
    /// Creates a driver that writes through `source`.
    pub fn new(source: &'a S, generator: &'a dyn IdentifierGenerator) -> Self {
        Self {
            source,
            generator,
            retry: RetryConfig::default(),
            cursors: None,
            abort: None,
        }
    }

    /// Sets the retry policy for each batch read and write.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Persists the cursor after every batch.
    pub fn with_cursor_store(mut self, cursors: &'a dyn CursorStore) -> Self {
        self.cursors = Some(cursors);
        self
    }

    /// Stops between batches once `abort` is requested.
    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Backfills every row of `target` whose shadow column is NULL.
    ///
    /// # Arguments
    /// * `target` - The identity or reference column to fill.
    /// * `batch_size` - Rows read and written per batch. Zero is treated as one.
    ///
    /// # Returns
    /// The number of rows written. Running it again on a fully backfilled
    /// column returns zero. A reference whose referenced row has no shadow
    /// identity yet fails with [`MigrationError::BackfillOrdering`].
    pub async fn backfill(
        &self,
        target: BackfillTarget<'_>,
        batch_size: usize,
    ) -> Result<u64, MigrationError> {
        let batch_size = batch_size.max(1);
        let label = target.label();

        let mut cursor = match self.cursors {
            Some(store) => store
                .load(target.table(), target.shadow_column())
                .await?
                .unwrap_or_else(|| BackfillCursor::start(&target)),
            None => BackfillCursor::start(&target),
        };
        if let Some(key) = &cursor.last_key {
            info!("Resuming backfill of {} after key {}", label, key);
        }

        let mut written = 0u64;
        loop {
            if let Some(abort) = &self.abort
                && abort.is_requested()
            {
                info!("Backfill of {} cancelled after {} rows", label, written);
                return Err(MigrationError::Cancelled(MigrationPhase::Backfilling));
            }

            let query = target.pending_query(cursor.last_key.as_ref(), batch_size);
            let rows = retry_transient(&self.retry, "fetch pending rows", || {
                self.source.fetch_pending(&query)
            })
            .await?;
            if rows.is_empty() {
                break;
            }

            let updates = self.compute_batch(&target, &rows).await?;
            let batch_written = retry_transient(&self.retry, "write shadow batch", || {
                self.source.write_shadow(
                    target.table(),
                    target.key_column(),
                    target.shadow_column(),
                    &updates,
                )
            })
            .await?;

            written += batch_written;
            cursor.rows_processed += rows.len() as u64;
            cursor.last_key = rows.last().map(|row| row.key.clone());
            debug!(
                "Backfilled batch of {} rows into {} ({} written, {} total)",
                rows.len(),
                label,
                batch_written,
                written
            );

            if let Some(store) = self.cursors {
                store.save(&cursor).await?;
            }
            if rows.len() < batch_size {
                break;
            }
        }

        if let Some(store) = self.cursors {
            store.clear(target.table(), target.shadow_column()).await?;
        }
        info!("Backfill of {} finished: {} rows written", label, written);
        Ok(written)
    }

    async fn compute_batch(
        &self,
        target: &BackfillTarget<'_>,
        rows: &[PendingRow],
    ) -> Result<Vec<(Value, Uuid)>, MigrationError> {
        match target {
            BackfillTarget::Identity(plan) => Ok(rows
                .iter()
                .map(|row| {
                    let seed = row.source.as_timestamp();
                    if seed.is_none()
                        && !row.source.is_null()
                        && let Some(column) = &plan.created_at_column
                    {
                        warn!(
                            "{}.{} holds {} which is not a timestamp; using current time",
                            plan.table, column, row.source
                        );
                    }
                    (row.key.clone(), self.generator.generate(seed))
                })
                .collect()),
            BackfillTarget::Reference {
                reference,
                referenced,
                ..
            } => {
                let keys: Vec<Value> = rows
                    .iter()
                    .map(|row| row.source.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let translated: HashMap<Value, Uuid> =
                    retry_transient(&self.retry, "look up referenced identifiers", || {
                        self.source.lookup_shadow(
                            &referenced.table,
                            &referenced.identity_column,
                            &referenced.shadow_column,
                            &keys,
                        )
                    })
                    .await?;

                rows.iter()
                    .map(|row| match translated.get(&row.source) {
                        Some(id) => Ok((row.key.clone(), *id)),
                        None => Err(MigrationError::BackfillOrdering {
                            table: reference.table.clone(),
                            column: reference.column.clone(),
                            referenced: referenced.table.clone(),
                            key: row.source.to_string(),
                        }),
                    })
                    .collect()
            }
        }
    }
}
