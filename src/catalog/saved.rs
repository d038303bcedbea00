//! Saved-book repository: one bookmark per book with notes and priority.

use tracing::instrument;

use super::models::SavedBook;
use super::{CatalogError, Result};
use crate::db::Database;

/// Repository for saved-book bookmarks.
#[derive(Debug, Clone)]
pub struct SavedBookRepository {
    db: Database,
}

impl SavedBookRepository {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Saves a book, replacing an existing bookmark's metadata.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the book row is missing,
    /// [`CatalogError::InvalidRecord`] on a negative priority.
    #[instrument(skip(self, notes, tags))]
    pub async fn save(
        &self,
        book_id: &str,
        notes: Option<&str>,
        tags: Option<&str>,
        priority: i64,
    ) -> Result<()> {
        if priority < 0 {
            return Err(CatalogError::invalid("priority cannot be negative"));
        }

        sqlx::query(
            r"INSERT INTO saved_books (book_id, notes, tags, priority)
              VALUES (?, ?, ?, ?)
              ON CONFLICT(book_id) DO UPDATE SET
                  notes = excluded.notes,
                  tags = excluded.tags,
                  priority = excluded.priority",
        )
        .bind(book_id)
        .bind(notes)
        .bind(tags)
        .bind(priority)
        .execute(self.db.pool())
        .await
        .map_err(|e| {
            if super::is_foreign_key_violation(&e) {
                CatalogError::not_found("book", book_id)
            } else {
                CatalogError::Database(e)
            }
        })?;

        Ok(())
    }

    /// Removes a bookmark.
    ///
    /// Returns whether a bookmark actually existed.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn unsave(&self, book_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM saved_books WHERE book_id = ?")
            .bind(book_id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Lists all bookmarks, highest priority first, then most recent.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    pub async fn list_all(&self) -> Result<Vec<SavedBook>> {
        let saved = sqlx::query_as::<_, SavedBook>(
            r"SELECT id, book_id, notes, tags, priority, saved_at
              FROM saved_books
              ORDER BY priority DESC, saved_at DESC, id DESC",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(saved)
    }

    /// Gets the bookmark for a book, if any.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    pub async fn get(&self, book_id: &str) -> Result<Option<SavedBook>> {
        let saved = sqlx::query_as::<_, SavedBook>(
            "SELECT id, book_id, notes, tags, priority, saved_at FROM saved_books WHERE book_id = ?",
        )
        .bind(book_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(saved)
    }
}
