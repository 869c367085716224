//! # Colors & Products Example
//!
//! Two tables keyed by integers, `products.color_id` pointing at `colors.id`.
//! The migration replaces both identities and the reference with UUIDv7
//! values, one phase at a time:
//!
//! ```text
//! Planned
//!   -> ShadowColumnsAdded   id_next / color_id_next added
//!   -> Backfilling          colors first, then products and their references
//!   -> Verified             catch-up pass, nothing missing or orphaned
//!   -> SwappedIn            old columns dropped, shadows renamed
//!   -> IndexesRebuilt       primary keys, NOT NULL and the foreign key restored
//!   -> Complete
//! ```
//!
//! Run with `RUST_LOG=info cargo run --example colors-products`.

use rekey::prelude::*;
use std::sync::Arc;

async fn seed(engine: &InMemoryEngine) -> Result<(), StorageError> {
    engine
        .create_table(
            "colors",
            vec![
                ColumnDef::new("id", ColumnType::Integer).not_null(),
                ColumnDef::new("name", ColumnType::Text),
            ],
        )
        .await?;
    engine.add_primary_key("colors", "id").await?;
    engine
        .create_table(
            "products",
            vec![
                ColumnDef::new("id", ColumnType::Integer).not_null(),
                ColumnDef::new("name", ColumnType::Text),
                ColumnDef::new("color_id", ColumnType::Integer).not_null(),
            ],
        )
        .await?;
    engine.add_primary_key("products", "id").await?;
    engine
        .add_foreign_key("products", "color_id", "colors", "id")
        .await?;

    for (id, name) in [(1i64, "red"), (2, "green"), (3, "blue")] {
        engine
            .insert("colors", [("id", Value::from(id)), ("name", Value::from(name))])
            .await?;
    }
    for (id, name, color) in [
        (1i64, "apple", 1i64),
        (2, "lime", 2),
        (3, "blueberry", 3),
        (4, "cherry", 1),
    ] {
        engine
            .insert(
                "products",
                [
                    ("id", Value::from(id)),
                    ("name", Value::from(name)),
                    ("color_id", Value::from(color)),
                ],
            )
            .await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("\n=== Colors & Products Example ===\n");

    let engine = InMemoryEngine::new();
    seed(&engine).await?;

    let plan = MigrationPlan::builder()
        .table("colors", "id")
        .table("products", "id")
        .reference("products", "color_id", "colors")
        .build()?;

    let journal = Arc::new(InMemoryJournal::default());
    let orchestrator = Orchestrator::new(engine.clone())
        .with_config(MigrationConfig {
            batch_size: 2,
            ..MigrationConfig::default()
        })
        .with_cursor_store(Arc::new(InMemoryCursorStore::new()))
        .with_journal(journal.clone());

    // Drive the run phase by phase instead of calling `run`.
    let mut run = orchestrator.start(&plan);
    while !run.phase().is_terminal() {
        let phase = run.advance().await?;
        println!("-> {}", phase);
    }
    println!();

    for row in engine.rows("products").await? {
        let name = row.get("name").cloned().unwrap_or(Value::Null);
        let color_id = row.get("color_id").cloned().unwrap_or(Value::Null);
        let color = match color_id.as_uuid() {
            Some(id) => engine.find_by("colors", "id", id).await?,
            None => None,
        };
        let color_name = color
            .and_then(|c| c.get("name").cloned())
            .unwrap_or(Value::Null);
        println!("{} -> {} ({})", name, color_name, color_id);
    }

    // Already terminal; this only records the report in the journal.
    let report = run.run_to_end().await;
    println!("\nReport:\n{}", serde_json::to_string_pretty(&report)?);
    log::info!("Journal holds {} run(s)", journal.reports().await.len());

    Ok(())
}
