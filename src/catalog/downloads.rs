//! Download repository: append-only record of download attempts.

use sqlx::Row;
use tracing::instrument;

use super::models::{DownloadRecord, NewDownload};
use super::{CatalogError, Result};
use crate::db::Database;

/// Repository for download records.
#[derive(Debug, Clone)]
pub struct DownloadRepository {
    db: Database,
}

impl DownloadRepository {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Appends a download record.
    ///
    /// # Returns
    ///
    /// The id of the new row.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the book row is missing,
    /// [`CatalogError::Database`] otherwise.
    #[instrument(skip(self, download), fields(book_id = download.book_id, status = %download.status))]
    pub async fn record(&self, download: &NewDownload<'_>) -> Result<i64> {
        let row = sqlx::query(
            r"INSERT INTO downloads (
                  book_id, credential_identity, filename, file_path,
                  file_size, status, error_message
              ) VALUES (?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(download.book_id)
        .bind(download.credential_identity)
        .bind(download.filename)
        .bind(download.file_path)
        .bind(download.file_size)
        .bind(download.status.as_str())
        .bind(download.error_message)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| {
            if super::is_foreign_key_violation(&e) {
                CatalogError::not_found("book", download.book_id)
            } else {
                CatalogError::Database(e)
            }
        })?;

        Ok(row.get("id"))
    }

    /// Lists the most recent downloads.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<DownloadRecord>> {
        let records = sqlx::query_as::<_, DownloadRecord>(
            r"SELECT id, book_id, credential_identity, filename, file_path,
                     file_size, status, error_message, downloaded_at
              FROM downloads
              ORDER BY downloaded_at DESC, id DESC
              LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Lists downloads made with a given credential.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_by_credential(&self, identity: &str) -> Result<Vec<DownloadRecord>> {
        let records = sqlx::query_as::<_, DownloadRecord>(
            r"SELECT id, book_id, credential_identity, filename, file_path,
                     file_size, status, error_message, downloaded_at
              FROM downloads
              WHERE credential_identity = ?
              ORDER BY downloaded_at DESC, id DESC",
        )
        .bind(identity)
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Lists downloads for one book.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    pub async fn list_for_book(&self, book_id: &str) -> Result<Vec<DownloadRecord>> {
        let records = sqlx::query_as::<_, DownloadRecord>(
            r"SELECT id, book_id, credential_identity, filename, file_path,
                     file_size, status, error_message, downloaded_at
              FROM downloads
              WHERE book_id = ?
              ORDER BY downloaded_at DESC, id DESC",
        )
        .bind(book_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Counts all download rows.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM downloads")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }
}
