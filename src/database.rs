//! Embedded SQLite database handle.
//!
//! One pool shared by every store. Schema bootstrap is idempotent and lives
//! with the individual stores; [`Database::connect`] only prepares the pool
//! and pragmas.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

/// Storage-layer error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    #[error("corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },

    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Shared SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Opens (creating if missing) the database at `path` with WAL and
    /// foreign keys enabled.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] when the file cannot be opened.
    pub async fn connect(path: impl AsRef<Path>) -> StorageResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!(path = %path.as_ref().display(), "database opened");
        Ok(Self { pool })
    }

    /// Opens an in-memory database for tests. A single connection keeps the
    /// whole pool on one shared store.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] when the connection fails.
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|source| StorageError::Database { source })?
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// The underlying pool, for store implementations.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Closes the pool, flushing WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
