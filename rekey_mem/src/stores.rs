use async_trait::async_trait;
use rekey_core::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keeps backfill cursors in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCursorStore {
    cursors: Arc<Mutex<HashMap<(String, String), BackfillCursor>>>,
}

impl InMemoryCursorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored cursors.
    pub async fn len(&self) -> usize {
        self.cursors.lock().await.len()
    }

    /// Whether no cursor is stored.
    pub async fn is_empty(&self) -> bool {
        self.cursors.lock().await.is_empty()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(
        &self,
        table: &str,
        shadow_column: &str,
    ) -> Result<Option<BackfillCursor>, StorageError> {
        Ok(self
            .cursors
            .lock()
            .await
            .get(&(table.to_string(), shadow_column.to_string()))
            .cloned())
    }

    async fn save(&self, cursor: &BackfillCursor) -> Result<(), StorageError> {
        self.cursors.lock().await.insert(
            (cursor.table.clone(), cursor.shadow_column.clone()),
            cursor.clone(),
        );
        Ok(())
    }

    async fn clear(&self, table: &str, shadow_column: &str) -> Result<(), StorageError> {
        self.cursors
            .lock()
            .await
            .remove(&(table.to_string(), shadow_column.to_string()));
        Ok(())
    }
}

/// Keeps migration reports in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJournal {
    reports: Arc<Mutex<Vec<MigrationReport>>>,
}

impl InMemoryJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded report, oldest first.
    pub async fn reports(&self) -> Vec<MigrationReport> {
        self.reports.lock().await.clone()
    }
}

#[async_trait]
impl MigrationJournal for InMemoryJournal {
    async fn record(
        &self,
        plan: &MigrationPlan,
        report: &MigrationReport,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::debug!(
            "Recording {} run over {} tables",
            report.phase,
            plan.tables().len()
        );
        self.reports.lock().await.push(report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cursors_round_trip_and_clear() {
        let store = InMemoryCursorStore::new();
        let cursor = BackfillCursor {
            table: "items".into(),
            shadow_column: "id_next".into(),
            last_key: Some(Value::Int(42)),
            rows_processed: 42,
        };
        store.save(&cursor).await.unwrap();
        assert_eq!(store.load("items", "id_next").await.unwrap(), Some(cursor));
        assert_eq!(store.load("items", "other").await.unwrap(), None);

        store.clear("items", "id_next").await.unwrap();
        assert!(store.is_empty().await);
    }
}
