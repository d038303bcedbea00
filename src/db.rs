//! Database connection and schema management.
//!
//! This module provides SQLite connectivity for the catalog with:
//! - Connection pool management
//! - WAL mode for concurrent reads
//! - Foreign-key enforcement (cascading deletes depend on it)
//! - Automatic migration execution
//!
//! The database location defaults to `~/.zlibrary/books.db` and can be
//! overridden with the `ZLIBRARY_DB_PATH` environment variable.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout. Connections wait this long before returning
/// SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Environment variable overriding the catalog database location.
pub const DB_PATH_ENV: &str = "ZLIBRARY_DB_PATH";

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// No home directory available to place the default database file.
    #[error("unable to determine home directory (set {DB_PATH_ENV} or HOME)")]
    HomeUnavailable,

    /// Failed to create the database parent directory.
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Resolves the catalog database path.
///
/// Priority:
/// 1. `ZLIBRARY_DB_PATH` environment variable
/// 2. `~/.zlibrary/books.db`
///
/// # Errors
///
/// Returns [`DbError::HomeUnavailable`] if neither the override nor a home
/// directory is available.
pub fn resolve_db_path() -> Result<PathBuf, DbError> {
    if let Some(value) = env::var_os(DB_PATH_ENV)
        && !value.is_empty()
    {
        return Ok(PathBuf::from(value));
    }

    let home = env::var_os("HOME").filter(|v| !v.is_empty());
    let Some(home) = home else {
        return Err(DbError::HomeUnavailable);
    };

    Ok(PathBuf::from(home).join(".zlibrary").join("books.db"))
}

/// Database connection wrapper with connection pool.
///
/// Handles SQLite connection pooling, WAL mode, foreign-key enforcement,
/// and automatic migration execution.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Database {
    /// Creates a new database connection to the specified path.
    ///
    /// This will:
    /// 1. Create the parent directory and database file if missing
    /// 2. Enable WAL mode and foreign-key enforcement
    /// 3. Run any pending migrations
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| DbError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            path: Some(db_path.to_path_buf()),
        })
    }

    /// Opens the database at the resolved default location.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`open`](Self::open), plus
    /// [`DbError::HomeUnavailable`] when no location can be resolved.
    pub async fn open_default() -> Result<Self, DbError> {
        let path = resolve_db_path()?;
        Self::open(&path).await
    }

    /// Creates an in-memory database for testing.
    ///
    /// The database exists only for the lifetime of the connection.
    /// Foreign-key enforcement is enabled so cascade behavior matches
    /// file-based databases.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn open_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, path: None })
    }

    /// Returns a reference to the underlying connection pool.
    ///
    /// Use this for executing queries with sqlx.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the on-disk size of the database file in bytes.
    ///
    /// Returns 0 for in-memory databases or when the file is missing.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map_or(0, |m| m.len())
    }

    /// Gracefully closes all connections in the pool.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}
