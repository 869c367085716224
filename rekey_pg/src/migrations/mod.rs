//! Bookkeeping tables used by rekey_pg itself.
//!
//! A migration's resumable state (backfill cursors and the run journal) lives
//! in a couple of small tables next to the application schema. They are
//! versioned, checksummed and tracked in `_rekey_migrations`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rekey_pg::migrations::Migrator;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://...").await?;
//! let applied = Migrator::new(pool).run().await?;
//! println!("Applied {} migrations", applied);
//! ```
//!
//! New migrations go in their own `mXXX_description.rs` file and are appended
//! to [`MIGRATIONS`].

mod m001_create_backfill_cursors;
mod m002_create_run_journal;

use m001_create_backfill_cursors::CreateBackfillCursors;
use m002_create_run_journal::CreateRunJournal;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;

/// All migrations in order. Add new migrations to the end.
///
/// There is no `down()`: the tables only hold resumable state, so a fresh
/// schema or a forward migration is always preferable.
const MIGRATIONS: &[&dyn Migration] = &[&CreateBackfillCursors, &CreateRunJournal];

/// Errors that can occur while applying bookkeeping migrations.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration's checksum doesn't match what was previously applied.
    #[error("Migration {version} ({name}) checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// Version of the migration.
        version: i64,
        /// Name of the migration.
        name: String,
        /// Checksum recorded in the database.
        expected: String,
        /// Checksum computed from the code.
        found: String,
    },

    /// A migration failed to execute.
    #[error("Migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        /// Version of the migration.
        version: i64,
        /// Name of the migration.
        name: String,
        /// Why it failed.
        reason: String,
    },
}

/// A single forward-only schema change.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, increasing version number.
    fn version(&self) -> i64;

    /// Human-readable name, e.g. `create_backfill_cursors`.
    fn name(&self) -> &'static str;

    /// Applies the change inside the migrator's transaction. Do not commit
    /// or roll back.
    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError>;

    /// SHA-256 of version and name, used to detect edited migrations.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version().to_le_bytes());
        hasher.update(self.name().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A migration recorded in `_rekey_migrations`.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    /// Version number.
    pub version: i64,
    /// Name.
    pub name: String,
    /// When it was applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// Checksum recorded at the time.
    pub checksum: String,
}

/// Applies the bookkeeping migrations in order, exactly once.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Creates a migrator over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _rekey_migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                checksum VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Runs every pending migration, each in its own transaction, and
    /// returns how many were applied.
    ///
    /// Fails before applying anything if an already applied migration's
    /// checksum changed.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        self.ensure_tracking_table().await?;

        let applied = self.applied().await?;
        for recorded in &applied {
            if let Some(migration) = MIGRATIONS.iter().find(|m| m.version() == recorded.version) {
                let checksum = migration.checksum();
                if checksum != recorded.checksum {
                    return Err(MigrationError::ChecksumMismatch {
                        version: recorded.version,
                        name: recorded.name.clone(),
                        expected: recorded.checksum.clone(),
                        found: checksum,
                    });
                }
            }
        }

        let applied_versions: HashSet<i64> = applied.iter().map(|m| m.version).collect();
        let mut count = 0;
        for migration in MIGRATIONS {
            if applied_versions.contains(&migration.version()) {
                log::debug!(
                    "Skipping migration {} ({}): already applied",
                    migration.version(),
                    migration.name()
                );
                continue;
            }

            log::info!(
                "Running migration {} ({})...",
                migration.version(),
                migration.name()
            );
            let mut tx = self.pool.begin().await?;
            migration.up(&mut tx).await.map_err(|e| match e {
                MigrationError::Database(db_err) => MigrationError::MigrationFailed {
                    version: migration.version(),
                    name: migration.name().to_string(),
                    reason: db_err.to_string(),
                },
                other => other,
            })?;

            sqlx::query(
                r#"
                INSERT INTO _rekey_migrations (version, name, checksum)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(migration.version())
            .bind(migration.name())
            .bind(migration.checksum())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            log::info!(
                "Migration {} ({}) applied successfully",
                migration.version(),
                migration.name()
            );
            count += 1;
        }

        Ok(count)
    }

    /// The highest applied version, 0 when none.
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        self.ensure_tracking_table().await?;
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM _rekey_migrations ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(v,)| v).unwrap_or(0))
    }

    /// Migrations not applied yet.
    pub async fn pending(&self) -> Result<Vec<&'static dyn Migration>, MigrationError> {
        let applied_versions: HashSet<i64> =
            self.applied().await?.iter().map(|m| m.version).collect();
        Ok(MIGRATIONS
            .iter()
            .filter(|m| !applied_versions.contains(&m.version()))
            .copied()
            .collect())
    }

    /// Migrations already applied, oldest first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_tracking_table().await?;
        let rows = sqlx::query(
            r#"
            SELECT version, name, applied_at, checksum
            FROM _rekey_migrations
            ORDER BY version ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AppliedMigration {
                version: row.get("version"),
                name: row.get("name"),
                applied_at: row.get("applied_at"),
                checksum: row.get("checksum"),
            })
            .collect())
    }
}
