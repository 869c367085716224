//! Runtime configuration for migration runs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of rows written per backfill batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Retry behaviour for transient storage failures.
///
/// Retries apply to a single DDL or DML call. A call that keeps failing is
/// reported as-is; the orchestrator never retries across phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry. Later retries double it.
    #[serde(with = "millis")]
    pub initial_delay: Duration,

    /// Upper bound for the backoff delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// A configuration that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// Configuration for the [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Rows per backfill batch. Each batch is its own transaction.
    pub batch_size: usize,

    /// Extra backfill passes run right before verification to pick up rows
    /// inserted while the first pass was running.
    pub catch_up_passes: u32,

    /// Backfill independent tables of the same dependency level concurrently.
    /// Batches within a table are always serial.
    pub parallel_tables: bool,

    /// Drop shadow columns when a run aborts before the swap.
    ///
    /// Turning this off keeps backfilled values so a later run resumes where
    /// this one stopped.
    pub cleanup_on_abort: bool,

    /// Retry policy for transient storage errors.
    pub retry: RetryConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            catch_up_passes: 1,
            parallel_tables: false,
            cleanup_on_abort: true,
            retry: RetryConfig::default(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
