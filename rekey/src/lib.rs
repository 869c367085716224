//! # Rekey
//!
//! Replaces integer identity columns, and the columns referencing them, with
//! time-ordered UUIDs while the application keeps running.

#![deny(missing_docs)]

#[cfg(feature = "in-memory")]
/// The in-memory storage engine.
pub mod mem {
    //! Re-exports `rekey_mem`.
    pub use rekey_mem::*;
}

#[cfg(feature = "postgres")]
/// The PostgreSQL storage engine.
pub mod pg {
    //! Re-exports `rekey_pg`.
    pub use rekey_pg::*;
}

pub mod prelude {
    //! The prelude module for the `rekey` crate.
    pub use rekey_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use rekey_mem::{InMemoryCursorStore, InMemoryEngine, InMemoryJournal};
    #[cfg(feature = "postgres")]
    pub use rekey_pg::{Migrator, PgCursorStore, PgEngine, PgMigrationJournal};
}
