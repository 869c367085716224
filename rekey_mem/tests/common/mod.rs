#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use rekey_core::prelude::*;
use rekey_mem::InMemoryEngine;
use std::time::Duration as StdDuration;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Creation time of the `i`th seeded row. Later ids are older, so key order
/// and creation order disagree.
pub fn created_at(i: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() - Duration::seconds(i)
}

/// `items(id bigint primary key, name text, created_at timestamptz)` with
/// `count` rows named `item-1` .. `item-{count}`.
pub async fn items_engine(count: i64) -> InMemoryEngine {
    let engine = InMemoryEngine::new();
    engine
        .create_table(
            "items",
            vec![
                ColumnDef::new("id", ColumnType::BigInt).not_null(),
                ColumnDef::new("name", ColumnType::Text),
                ColumnDef::new("created_at", ColumnType::Timestamp),
            ],
        )
        .await
        .unwrap();
    engine.add_primary_key("items", "id").await.unwrap();
    for i in 1..=count {
        insert_item(&engine, i).await;
    }
    engine
}

pub async fn insert_item(engine: &InMemoryEngine, i: i64) {
    engine
        .insert(
            "items",
            [
                ("id", Value::from(i)),
                ("name", Value::from(format!("item-{}", i))),
                ("created_at", Value::from(created_at(i))),
            ],
        )
        .await
        .unwrap();
}

pub fn items_plan() -> MigrationPlan {
    MigrationPlan::builder()
        .table_seeded("items", "id", "created_at")
        .build()
        .unwrap()
}

/// `colors` with five rows and `products` with ten rows, each product
/// pointing at color `(i % 5) + 1` through a NOT NULL `color_id`.
pub async fn colors_products_engine(engine: InMemoryEngine) -> InMemoryEngine {
    let color_id = ColumnDef::new("color_id", ColumnType::Integer).not_null();
    seed_colors_products(engine, color_id).await
}

/// Like [`colors_products_engine`] but `products.color_id` accepts NULL.
pub async fn nullable_colors_products_engine(engine: InMemoryEngine) -> InMemoryEngine {
    let color_id = ColumnDef::new("color_id", ColumnType::Integer);
    seed_colors_products(engine, color_id).await
}

async fn seed_colors_products(engine: InMemoryEngine, color_id: ColumnDef) -> InMemoryEngine {
    engine
        .create_table(
            "colors",
            vec![
                ColumnDef::new("id", ColumnType::Integer).not_null(),
                ColumnDef::new("name", ColumnType::Text),
            ],
        )
        .await
        .unwrap();
    engine.add_primary_key("colors", "id").await.unwrap();
    engine
        .create_table(
            "products",
            vec![
                ColumnDef::new("id", ColumnType::Integer).not_null(),
                ColumnDef::new("name", ColumnType::Text),
                color_id,
            ],
        )
        .await
        .unwrap();
    engine.add_primary_key("products", "id").await.unwrap();
    engine
        .add_foreign_key("products", "color_id", "colors", "id")
        .await
        .unwrap();

    for i in 1..=5i64 {
        engine
            .insert(
                "colors",
                [
                    ("id", Value::from(i)),
                    ("name", Value::from(format!("color-{}", i))),
                ],
            )
            .await
            .unwrap();
    }
    for i in 1..=10i64 {
        engine
            .insert(
                "products",
                [
                    ("id", Value::from(i)),
                    ("name", Value::from(format!("product-{}", i))),
                    ("color_id", Value::from((i % 5) + 1)),
                ],
            )
            .await
            .unwrap();
    }
    engine
}

pub fn colors_products_plan() -> MigrationPlan {
    MigrationPlan::builder()
        .table("colors", "id")
        .table("products", "id")
        .reference("products", "color_id", "colors")
        .build()
        .unwrap()
}

/// Fast retries so failure tests don't sleep.
pub fn quick_config() -> MigrationConfig {
    MigrationConfig {
        batch_size: 3,
        retry: RetryConfig {
            max_retries: 3,
            initial_delay: StdDuration::from_millis(1),
            max_delay: StdDuration::from_millis(5),
        },
        ..Default::default()
    }
}

pub async fn column_type(engine: &InMemoryEngine, table: &str, column: &str) -> Option<ColumnType> {
    engine
        .describe_table(table)
        .await
        .unwrap()
        .column(column)
        .map(|c| c.column_type.clone())
}
