//! # Rekey in-memory engine
//!
//! An in-memory [`StorageEngine`](rekey_core::storage::StorageEngine) with
//! SQL-like constraint checking, plus in-memory cursor and report stores.
//! Faults and hooks can be injected per [`Operation`] to rehearse failures.
//!
//! # Rehearsing a plan
//!
//! ```ignore
//! use rekey_core::prelude::*;
//! use rekey_mem::{InMemoryEngine, Operation};
//!
//! let engine = InMemoryEngine::new();
//! engine
//!     .create_table("items", vec![ColumnDef::new("id", ColumnType::BigInt).not_null()])
//!     .await?;
//! engine.add_primary_key("items", "id").await?;
//! engine.insert("items", [("id", 1i64)]).await?;
//!
//! // Simulate a write arriving just before the swap takes its locks.
//! let writer = engine.clone();
//! engine.on(Operation::BeginSwap, move || {
//!     let writer = writer.clone();
//!     async move {
//!         let _ = writer.insert("items", [("id", 2i64)]).await;
//!     }
//! });
//!
//! let plan = MigrationPlan::builder().table("items", "id").build()?;
//! let report = Orchestrator::new(engine.clone()).run(&plan).await;
//! assert!(report.is_complete());
//! ```
//!
//! See [`InMemorySwap`] for how the swap boundary stages its changes.

#![deny(missing_docs)]

mod database;
mod engine;
mod stores;

pub use database::{Row, index_name};
pub use engine::{InMemoryEngine, InMemorySwap, Operation};
pub use stores::{InMemoryCursorStore, InMemoryJournal};
