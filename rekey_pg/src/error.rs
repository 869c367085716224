//! Classification of Postgres errors into [`StorageError`]s.

use rekey_core::error::StorageError;

/// Maps a sqlx error raised by a statement on `table.column`.
///
/// Connection failures, serialization failures, deadlocks and lock timeouts
/// are reported as [`StorageError::Unavailable`] so the orchestrator retries
/// them.
pub fn storage_error(err: sqlx::Error, table: &str, column: &str) -> StorageError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let message = db.message().to_string();
            match code.as_str() {
                c if c.starts_with("08") => StorageError::Unavailable(message),
                "40001" | "40P01" | "55P03" | "57P01" | "57P03" => {
                    StorageError::Unavailable(message)
                }
                "42701" | "42703" | "42704" | "42710" | "42P07" | "42P16" => {
                    StorageError::conflict(table, column, message)
                }
                "42P01" => StorageError::UnknownTable(table.to_string()),
                c if c.starts_with("23") || c == "2BP01" => StorageError::Constraint(message),
                _ => StorageError::Unexpected(format!("{} ({})", message, code)),
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => {
            StorageError::Unavailable(err.to_string())
        }
        _ => StorageError::Unexpected(err.to_string()),
    }
}

/// Maps an error that isn't tied to a particular column, such as failing to
/// acquire a connection.
pub fn connection_error(err: sqlx::Error) -> StorageError {
    storage_error(err, "", "")
}
