//! Catalog: the durable local store of books, authors, reading lists,
//! saved books, downloads, and search history.
//!
//! One repository per entity family ([`books`], [`authors`], [`lists`],
//! [`saved`], [`downloads`], [`history`]) plus the [`service`] layer that
//! orchestrates multi-repository operations (ingestion, browsing,
//! import/export, stats).

pub mod authors;
pub mod books;
pub mod downloads;
pub mod history;
pub mod ingest;
pub mod lists;
pub mod models;
pub mod saved;
pub mod service;
pub mod transfer;

use thiserror::Error;

pub use authors::AuthorRepository;
pub use books::BookRepository;
pub use downloads::DownloadRepository;
pub use history::SearchHistoryRepository;
pub use ingest::{IngestSummary, split_authors};
pub use lists::ReadingListRepository;
pub use models::{
    Author, Book, BookFilters, BookWithAuthors, CatalogStats, DownloadRecord, DownloadStatus,
    NewDownload, ReadingList, SavedBook, SavedEntry, SearchRecord,
};
pub use saved::SavedBookRepository;
pub use service::CatalogService;

/// Result type for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Errors from catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Underlying database failure (constraint violation, corruption).
    #[error("catalog database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A referenced row does not exist.
    #[error("{what} not found: {key}")]
    NotFound {
        /// Entity family, e.g. "book" or "reading list".
        what: &'static str,
        /// The key that failed to resolve.
        key: String,
    },

    /// A uniqueness rule was violated.
    #[error("{what} already exists: {key}")]
    Duplicate {
        /// Entity family, e.g. "reading list".
        what: &'static str,
        /// The conflicting key.
        key: String,
    },

    /// A record failed validation before touching the store.
    #[error("invalid record: {reason}")]
    InvalidRecord {
        /// What is wrong with the record.
        reason: String,
    },
}

impl CatalogError {
    /// Creates a not-found error.
    pub fn not_found(what: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            key: key.into(),
        }
    }

    /// Creates a duplicate error.
    pub fn duplicate(what: &'static str, key: impl Into<String>) -> Self {
        Self::Duplicate {
            what,
            key: key.into(),
        }
    }

    /// Creates an invalid-record error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }
}

/// Whether a sqlx error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

/// Whether a sqlx error is a FOREIGN KEY constraint violation.
pub(crate) fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::ForeignKeyViolation
    )
}
