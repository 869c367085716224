mod common;

use common::*;
use rekey_core::identifier::timestamp_millis;
use rekey_core::prelude::*;
use rekey_mem::{InMemoryCursorStore, InMemoryEngine, InMemoryJournal, Operation};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

async fn ids_by_name(engine: &InMemoryEngine, table: &str, column: &str) -> HashMap<String, Uuid> {
    engine
        .rows(table)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|row| {
            let name = match row.get("name") {
                Some(Value::Text(name)) => name.clone(),
                _ => return None,
            };
            row.get(column).and_then(Value::as_uuid).map(|id| (name, id))
        })
        .collect()
}

/// Inserts `row` through a clone of `engine` the first time `operation` is
/// called, standing in for application traffic at that exact moment.
fn insert_on_first(
    engine: &InMemoryEngine,
    operation: Operation,
    table: &'static str,
    row: Vec<(&'static str, Value)>,
) {
    let fired = Arc::new(AtomicBool::new(false));
    let writer = engine.clone();
    engine.on(operation, move || {
        let row = (!fired.swap(true, Ordering::SeqCst)).then(|| row.clone());
        let writer = writer.clone();
        async move {
            if let Some(row) = row {
                writer.insert(table, row).await.unwrap();
            }
        }
    });
}

#[tokio::test]
async fn single_table_is_migrated_in_creation_order() {
    init_logger();
    let engine = items_engine(10).await;
    let orchestrator = Orchestrator::new(engine.clone()).with_config(quick_config());

    let report = orchestrator.run(&items_plan()).await;

    assert!(report.is_complete(), "{:?}", report.reason);
    assert_eq!(report.reached, MigrationPhase::Complete);
    assert_eq!(report.rows_backfilled.get("items.id_next"), Some(&10));
    assert!(report.verification_failures.is_empty());

    let items = engine.describe_table("items").await.unwrap();
    assert_eq!(items.identity_column.as_deref(), Some("id"));
    assert_eq!(items.column("id").unwrap().column_type, ColumnType::Uuid);
    assert!(!items.has_column("id_next"));

    let rows = engine.rows("items").await.unwrap();
    assert_eq!(rows.len(), 10);
    let mut by_id: Vec<(Uuid, chrono::DateTime<chrono::Utc>)> = rows
        .iter()
        .map(|row| {
            (
                row["id"].as_uuid().unwrap(),
                row["created_at"].as_timestamp().unwrap(),
            )
        })
        .collect();
    for (id, created) in &by_id {
        assert_eq!(id.get_version_num(), 7);
        assert_eq!(timestamp_millis(id), created.timestamp_millis() as u64);
    }
    by_id.sort_by_key(|(id, _)| *id);
    assert!(by_id.windows(2).all(|w| w[0].1 < w[1].1));
}

#[tokio::test]
async fn references_follow_their_rows() {
    init_logger();
    let engine = colors_products_engine(InMemoryEngine::new()).await;
    let orchestrator = Orchestrator::new(engine.clone()).with_config(quick_config());

    let report = orchestrator.run(&colors_products_plan()).await;

    assert!(report.is_complete(), "{:?}", report.reason);
    assert_eq!(report.rows_backfilled.get("colors.id_next"), Some(&5));
    assert_eq!(report.rows_backfilled.get("products.id_next"), Some(&10));
    assert_eq!(report.rows_backfilled.get("products.color_id_next"), Some(&10));

    let colors = ids_by_name(&engine, "colors", "id").await;
    assert_eq!(colors.len(), 5);
    for row in engine.rows("products").await.unwrap() {
        let Some(Value::Text(name)) = row.get("name") else {
            panic!("product without name");
        };
        let i: i64 = name.trim_start_matches("product-").parse().unwrap();
        let expected = colors[&format!("color-{}", (i % 5) + 1)];
        assert_eq!(row["color_id"], Value::Uuid(expected));
    }

    assert_eq!(
        column_type(&engine, "products", "color_id").await,
        Some(ColumnType::Uuid)
    );
    let err = engine
        .insert(
            "products",
            [
                ("id", Value::from(Uuid::now_v7())),
                ("color_id", Value::from(Uuid::now_v7())),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Constraint(_)));

    let err = engine
        .insert("products", [("id", Value::from(Uuid::now_v7()))])
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Constraint(_)));
}

#[tokio::test]
async fn interrupted_backfill_keeps_written_values() {
    init_logger();
    let engine = items_engine(10).await;
    engine.fail(
        Operation::WriteShadow,
        3,
        1,
        StorageError::Unexpected("disk full".into()),
    );
    let config = MigrationConfig {
        batch_size: 1,
        cleanup_on_abort: false,
        ..quick_config()
    };

    let first = Orchestrator::new(engine.clone())
        .with_config(config.clone())
        .run(&items_plan())
        .await;
    assert_eq!(first.phase, MigrationPhase::Aborted);
    assert_eq!(first.reached, MigrationPhase::ShadowColumnsAdded);
    assert!(!first.manual_intervention_required);

    let written = ids_by_name(&engine, "items", "id_next").await;
    assert_eq!(written.len(), 3);

    let second = Orchestrator::new(engine.clone())
        .with_config(config)
        .run(&items_plan())
        .await;
    assert!(second.is_complete(), "{:?}", second.reason);
    assert_eq!(second.rows_backfilled.get("items.id_next"), Some(&7));

    let migrated = ids_by_name(&engine, "items", "id").await;
    assert_eq!(migrated.len(), 10);
    for (name, id) in written {
        assert_eq!(migrated[&name], id, "{} changed identifier", name);
    }
}

#[tokio::test]
async fn cursor_is_saved_on_interruption_and_cleared_on_completion() {
    init_logger();
    let engine = items_engine(10).await;
    engine.fail(
        Operation::WriteShadow,
        3,
        1,
        StorageError::Unexpected("disk full".into()),
    );
    let cursors = InMemoryCursorStore::new();
    let config = MigrationConfig {
        batch_size: 1,
        cleanup_on_abort: false,
        ..quick_config()
    };

    let first = Orchestrator::new(engine.clone())
        .with_config(config.clone())
        .with_cursor_store(Arc::new(cursors.clone()))
        .run(&items_plan())
        .await;
    assert_eq!(first.phase, MigrationPhase::Aborted);

    let cursor = cursors.load("items", "id_next").await.unwrap().unwrap();
    assert_eq!(cursor.last_key, Some(Value::Int(3)));
    assert_eq!(cursor.rows_processed, 3);

    let second = Orchestrator::new(engine.clone())
        .with_config(config)
        .with_cursor_store(Arc::new(cursors.clone()))
        .run(&items_plan())
        .await;
    assert!(second.is_complete(), "{:?}", second.reason);
    assert!(cursors.is_empty().await);
}

#[tokio::test]
async fn completed_migration_is_not_run_twice() {
    init_logger();
    let engine = items_engine(4).await;
    let orchestrator = Orchestrator::new(engine.clone()).with_config(quick_config());
    assert!(orchestrator.run(&items_plan()).await.is_complete());
    let before = ids_by_name(&engine, "items", "id").await;

    let again = orchestrator.run(&items_plan()).await;

    assert_eq!(again.phase, MigrationPhase::Aborted);
    assert_eq!(again.reached, MigrationPhase::Planned);
    assert!(again.manual_intervention_required);
    assert!(again.reason.unwrap().contains("already been swapped"));
    assert_eq!(ids_by_name(&engine, "items", "id").await, before);
}

#[tokio::test]
async fn cancelling_before_the_swap_drops_shadow_columns() {
    init_logger();
    let engine = colors_products_engine(InMemoryEngine::new()).await;
    let orchestrator = Orchestrator::new(engine.clone()).with_config(quick_config());
    let plan = colors_products_plan();
    let mut run = orchestrator.start(&plan);

    assert_eq!(
        run.advance().await.unwrap(),
        MigrationPhase::ShadowColumnsAdded
    );
    assert_eq!(run.advance().await.unwrap(), MigrationPhase::Backfilling);
    orchestrator.abort_handle().abort();

    let err = run.advance().await.unwrap_err();
    assert!(matches!(err, MigrationError::Cancelled(MigrationPhase::Backfilling)));
    assert_eq!(run.phase(), MigrationPhase::Aborted);

    let report = run.report();
    assert_eq!(report.reached, MigrationPhase::Backfilling);
    assert!(!report.manual_intervention_required);
    assert!(report.cleanup_errors.is_empty());

    assert!(column_type(&engine, "colors", "id_next").await.is_none());
    assert!(column_type(&engine, "products", "id_next").await.is_none());
    assert!(column_type(&engine, "products", "color_id_next").await.is_none());
    assert_eq!(
        column_type(&engine, "products", "color_id").await,
        Some(ColumnType::Integer)
    );

    assert!(matches!(
        run.advance().await,
        Err(MigrationError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn cancelling_during_the_swap_stops_after_commit() {
    init_logger();
    let engine = items_engine(5).await;
    let orchestrator = Orchestrator::new(engine.clone()).with_config(quick_config());
    let abort = orchestrator.abort_handle();
    engine.on(Operation::Commit, move || {
        abort.abort();
        async {}
    });

    let report = orchestrator.run(&items_plan()).await;

    assert_eq!(report.phase, MigrationPhase::Aborted);
    assert_eq!(report.reached, MigrationPhase::SwappedIn);
    assert!(report.manual_intervention_required);
    assert_eq!(
        column_type(&engine, "items", "id").await,
        Some(ColumnType::Uuid)
    );
    assert!(column_type(&engine, "items", "id_next").await.is_none());
}

#[tokio::test]
async fn engines_without_multi_table_ddl_swap_table_by_table() {
    init_logger();
    let engine = colors_products_engine(InMemoryEngine::new().with_capabilities(
        EngineCapabilities {
            multi_table_ddl_transactions: false,
        },
    ))
    .await;

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&colors_products_plan())
        .await;

    assert!(report.is_complete(), "{:?}", report.reason);
    assert_eq!(engine.calls(Operation::BeginSwap), 2);
    assert_eq!(engine.calls(Operation::Commit), 2);
}

#[tokio::test]
async fn failed_second_boundary_leaves_first_table_swapped() {
    init_logger();
    let engine = colors_products_engine(InMemoryEngine::new().with_capabilities(
        EngineCapabilities {
            multi_table_ddl_transactions: false,
        },
    ))
    .await;
    engine.fail(
        Operation::Commit,
        1,
        1,
        StorageError::Unexpected("connection lost".into()),
    );

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&colors_products_plan())
        .await;

    assert_eq!(report.phase, MigrationPhase::Aborted);
    assert_eq!(report.reached, MigrationPhase::Verified);
    assert!(report.manual_intervention_required);
    let reason = report.reason.unwrap();
    assert!(reason.contains("1 of 2 tables already swapped"), "{}", reason);
    assert!(reason.contains("connection lost"), "{}", reason);

    // products committed in its own boundary before colors failed.
    assert_eq!(
        column_type(&engine, "products", "id").await,
        Some(ColumnType::Uuid)
    );
    assert_eq!(
        column_type(&engine, "products", "color_id").await,
        Some(ColumnType::Uuid)
    );
    assert!(column_type(&engine, "products", "color_id_next").await.is_none());
    assert_eq!(
        column_type(&engine, "colors", "id").await,
        Some(ColumnType::Integer)
    );
    assert_eq!(
        column_type(&engine, "colors", "id_next").await,
        Some(ColumnType::Uuid)
    );
}

#[tokio::test]
async fn transient_errors_are_retried() {
    init_logger();
    let engine = items_engine(10).await;
    engine.fail(
        Operation::WriteShadow,
        1,
        2,
        StorageError::Unavailable("connection reset".into()),
    );
    engine.fail(
        Operation::AddColumn,
        0,
        1,
        StorageError::Unavailable("connection reset".into()),
    );

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&items_plan())
        .await;

    assert!(report.is_complete(), "{:?}", report.reason);
    assert_eq!(report.rows_backfilled.get("items.id_next"), Some(&10));
}

#[tokio::test]
async fn exhausted_retries_abort_and_clean_up() {
    init_logger();
    let engine = items_engine(10).await;
    engine.fail(
        Operation::FetchPending,
        0,
        100,
        StorageError::Unavailable("connection refused".into()),
    );

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&items_plan())
        .await;

    assert_eq!(report.phase, MigrationPhase::Aborted);
    assert_eq!(report.reached, MigrationPhase::ShadowColumnsAdded);
    assert!(report.reason.unwrap().contains("connection refused"));
    assert_eq!(engine.calls(Operation::FetchPending), 4);
    assert!(column_type(&engine, "items", "id_next").await.is_none());
}

#[tokio::test]
async fn rows_inserted_during_backfill_are_caught_up() {
    init_logger();
    let engine = items_engine(10).await;
    let orchestrator = Orchestrator::new(engine.clone()).with_config(quick_config());
    let plan = items_plan();
    let mut run = orchestrator.start(&plan);

    run.advance().await.unwrap();
    run.advance().await.unwrap();
    insert_item(&engine, 11).await;
    insert_item(&engine, 12).await;
    assert_eq!(run.advance().await.unwrap(), MigrationPhase::Verified);
    assert_eq!(run.report().rows_backfilled.get("items.id_next"), Some(&12));

    let report = run.run_to_end().await;
    assert!(report.is_complete(), "{:?}", report.reason);
    assert_eq!(ids_by_name(&engine, "items", "id").await.len(), 12);
}

#[tokio::test]
async fn rows_inserted_while_checking_completeness_are_caught_up() {
    init_logger();
    let engine = items_engine(10).await;
    insert_on_first(
        &engine,
        Operation::CountMissing,
        "items",
        vec![
            ("id", Value::from(11i64)),
            ("name", Value::from("item-11")),
            ("created_at", Value::from(created_at(11))),
        ],
    );

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&items_plan())
        .await;

    assert!(report.is_complete(), "{:?}", report.reason);
    assert!(report.verification_failures.is_empty());
    assert_eq!(report.rows_backfilled.get("items.id_next"), Some(&11));
    assert_eq!(ids_by_name(&engine, "items", "id").await.len(), 11);
}

#[tokio::test]
async fn rows_inserted_before_the_swap_lock_are_backfilled_under_it() {
    init_logger();
    let engine = colors_products_engine(InMemoryEngine::new()).await;
    insert_on_first(
        &engine,
        Operation::BeginSwap,
        "products",
        vec![
            ("id", Value::from(11i64)),
            ("name", Value::from("product-11")),
            ("color_id", Value::from(1i64)),
        ],
    );

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&colors_products_plan())
        .await;

    assert!(report.is_complete(), "{:?}", report.reason);
    assert_eq!(report.rows_backfilled.get("colors.id_next"), Some(&5));
    assert_eq!(report.rows_backfilled.get("products.id_next"), Some(&11));
    assert_eq!(report.rows_backfilled.get("products.color_id_next"), Some(&11));

    let colors = ids_by_name(&engine, "colors", "id").await;
    let products = ids_by_name(&engine, "products", "color_id").await;
    assert_eq!(products.len(), 11);
    assert_eq!(products["product-11"], colors["color-1"]);
}

#[tokio::test]
async fn late_rows_without_catch_up_fail_verification() {
    init_logger();
    let engine = items_engine(10).await;
    let orchestrator = Orchestrator::new(engine.clone()).with_config(MigrationConfig {
        catch_up_passes: 0,
        ..quick_config()
    });
    let plan = items_plan();
    let mut run = orchestrator.start(&plan);

    run.advance().await.unwrap();
    run.advance().await.unwrap();
    insert_item(&engine, 11).await;

    let err = run.advance().await.unwrap_err();
    assert!(matches!(err, MigrationError::IncompleteBackfill { count: 1, .. }));

    let report = run.report();
    assert_eq!(report.phase, MigrationPhase::Aborted);
    assert_eq!(report.reached, MigrationPhase::Backfilling);
    assert_eq!(report.verification_failures.len(), 1);
    assert_eq!(
        report.verification_failures[0].kind,
        VerificationKind::IncompleteBackfill
    );
    assert_eq!(
        column_type(&engine, "items", "id").await,
        Some(ColumnType::BigInt)
    );
}

#[tokio::test]
async fn reference_changed_after_backfill_is_detected() {
    init_logger();
    let engine = colors_products_engine(InMemoryEngine::new()).await;
    let orchestrator = Orchestrator::new(engine.clone()).with_config(quick_config());
    let plan = colors_products_plan();
    let mut run = orchestrator.start(&plan);

    run.advance().await.unwrap();
    run.advance().await.unwrap();
    // product-1 points at color 2; move it to color 3.
    engine
        .update("products", "id", 1i64, "color_id", 3i64)
        .await
        .unwrap();

    let err = run.advance().await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::MistranslatedReferences { count: 1, .. }
    ));
    let report = run.report();
    assert_eq!(
        report.verification_failures[0].kind,
        VerificationKind::MistranslatedReferences
    );
    assert!(column_type(&engine, "products", "color_id_next").await.is_none());
}

#[tokio::test]
async fn failed_swap_is_rolled_back_and_flagged() {
    init_logger();
    let engine = items_engine(5).await;
    engine.fail(
        Operation::RenameColumn,
        0,
        1,
        StorageError::Unexpected("lock timeout".into()),
    );

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&items_plan())
        .await;

    assert_eq!(report.phase, MigrationPhase::Aborted);
    assert_eq!(report.reached, MigrationPhase::Verified);
    assert!(report.manual_intervention_required);
    assert!(report.reason.unwrap().contains("rolled back"));
    assert_eq!(
        column_type(&engine, "items", "id").await,
        Some(ColumnType::BigInt)
    );
    assert_eq!(
        column_type(&engine, "items", "id_next").await,
        Some(ColumnType::Uuid)
    );
}

#[tokio::test]
async fn cleanup_failures_are_reported() {
    init_logger();
    let engine = items_engine(3).await;
    engine.fail(
        Operation::DropColumn,
        0,
        100,
        StorageError::Unexpected("permission denied".into()),
    );
    let orchestrator = Orchestrator::new(engine.clone()).with_config(quick_config());
    let plan = items_plan();
    let mut run = orchestrator.start(&plan);

    run.advance().await.unwrap();
    run.abort("operator request").await.unwrap();

    let report = run.report();
    assert_eq!(report.phase, MigrationPhase::Aborted);
    assert_eq!(report.reason.as_deref(), Some("operator request"));
    assert_eq!(report.cleanup_errors.len(), 1);
    assert!(report.cleanup_errors[0].contains("items.id_next"));
}

#[tokio::test]
async fn self_references_are_translated() {
    init_logger();
    let engine = InMemoryEngine::new();
    engine
        .create_table(
            "employees",
            vec![
                ColumnDef::new("id", ColumnType::Integer).not_null(),
                ColumnDef::new("name", ColumnType::Text),
                ColumnDef::new("manager_id", ColumnType::Integer),
            ],
        )
        .await
        .unwrap();
    engine.add_primary_key("employees", "id").await.unwrap();
    engine
        .add_foreign_key("employees", "manager_id", "employees", "id")
        .await
        .unwrap();
    for (id, name, manager) in [(1i64, "ada", None), (2, "bob", Some(1i64)), (3, "cy", Some(2))] {
        engine
            .insert(
                "employees",
                [
                    ("id", Value::from(id)),
                    ("name", Value::from(name)),
                    ("manager_id", Value::from(manager)),
                ],
            )
            .await
            .unwrap();
    }
    let plan = MigrationPlan::builder()
        .table("employees", "id")
        .nullable_reference("employees", "manager_id", "employees")
        .build()
        .unwrap();

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&plan)
        .await;

    assert!(report.is_complete(), "{:?}", report.reason);
    let ids = ids_by_name(&engine, "employees", "id").await;
    let managers = ids_by_name(&engine, "employees", "manager_id").await;
    assert!(!managers.contains_key("ada"));
    assert_eq!(managers["bob"], ids["ada"]);
    assert_eq!(managers["cy"], ids["bob"]);
}

#[tokio::test]
async fn parallel_backfill_covers_independent_tables() {
    init_logger();
    let engine = colors_products_engine(items_engine(6).await).await;
    let plan = MigrationPlan::builder()
        .table_seeded("items", "id", "created_at")
        .table("colors", "id")
        .table("products", "id")
        .reference("products", "color_id", "colors")
        .build()
        .unwrap();

    let report = Orchestrator::new(engine.clone())
        .with_config(MigrationConfig {
            parallel_tables: true,
            ..quick_config()
        })
        .run(&plan)
        .await;

    assert!(report.is_complete(), "{:?}", report.reason);
    assert_eq!(report.total_rows_backfilled(), 6 + 5 + 10 + 10);
}

#[tokio::test]
async fn journal_records_every_run() {
    init_logger();
    let engine = items_engine(2).await;
    let journal = InMemoryJournal::new();
    let orchestrator = Orchestrator::new(engine)
        .with_config(quick_config())
        .with_journal(Arc::new(journal.clone()));

    orchestrator.run(&items_plan()).await;
    orchestrator.run(&items_plan()).await;

    let reports = journal.reports().await;
    assert_eq!(reports.len(), 2);
    assert!(reports[0].is_complete());
    assert_eq!(reports[1].phase, MigrationPhase::Aborted);
}

#[tokio::test]
async fn null_references_keep_their_column_nullable() {
    init_logger();
    let engine = nullable_colors_products_engine(InMemoryEngine::new()).await;
    engine
        .insert(
            "products",
            [
                ("id", Value::from(11i64)),
                ("name", Value::from("loose")),
            ],
        )
        .await
        .unwrap();

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&colors_products_plan())
        .await;

    assert!(report.is_complete(), "{:?}", report.reason);
    assert!(!report.manual_intervention_required);
    assert_eq!(report.rows_backfilled.get("products.color_id_next"), Some(&10));
    assert_eq!(engine.calls(Operation::SetNotNull), 0);

    let loose = engine.find_by("products", "name", "loose").await.unwrap().unwrap();
    assert!(loose.get("color_id").is_none_or(Value::is_null));
    let products = engine.describe_table("products").await.unwrap();
    assert!(products.column("color_id").unwrap().nullable);

    engine
        .insert("products", [("id", Value::from(Uuid::now_v7()))])
        .await
        .unwrap();
    let err = engine
        .insert(
            "products",
            [
                ("id", Value::from(Uuid::now_v7())),
                ("color_id", Value::from(Uuid::now_v7())),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Constraint(_)));
}

#[tokio::test]
async fn not_null_references_get_their_constraint_back() {
    init_logger();
    let engine = colors_products_engine(InMemoryEngine::new()).await;

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&colors_products_plan())
        .await;

    assert!(report.is_complete(), "{:?}", report.reason);
    assert_eq!(engine.calls(Operation::SetNotNull), 1);
    let products = engine.describe_table("products").await.unwrap();
    assert!(!products.column("color_id").unwrap().nullable);
}

#[tokio::test]
async fn identity_columns_that_cannot_key_a_batch_are_refused() {
    init_logger();
    let engine = InMemoryEngine::new();
    engine
        .create_table(
            "readings",
            vec![
                ColumnDef::new("taken_at", ColumnType::Timestamp).not_null(),
                ColumnDef::new("value", ColumnType::BigInt),
            ],
        )
        .await
        .unwrap();
    let plan = MigrationPlan::builder()
        .table("readings", "taken_at")
        .build()
        .unwrap();

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&plan)
        .await;

    assert_eq!(report.phase, MigrationPhase::Aborted);
    assert_eq!(report.reached, MigrationPhase::Planned);
    assert!(!report.manual_intervention_required);
    let reason = report.reason.unwrap();
    assert!(reason.contains("readings.taken_at"), "{}", reason);
    assert!(reason.contains("cannot be used as a key"), "{}", reason);
    assert_eq!(engine.calls(Operation::AddColumn), 0);
}

#[tokio::test]
async fn missing_columns_abort_before_any_change() {
    init_logger();
    let engine = items_engine(2).await;
    let plan = MigrationPlan::builder()
        .table_seeded("items", "id", "inserted_at")
        .build()
        .unwrap();

    let report = Orchestrator::new(engine.clone())
        .with_config(quick_config())
        .run(&plan)
        .await;

    assert_eq!(report.phase, MigrationPhase::Aborted);
    assert_eq!(report.reached, MigrationPhase::Planned);
    assert!(report.reason.unwrap().contains("inserted_at"));
    assert_eq!(engine.calls(Operation::AddColumn), 0);
}
