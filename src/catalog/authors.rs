//! Author repository: unique names and ordered book-author links.

use std::collections::HashMap;

use sqlx::QueryBuilder;
use tracing::instrument;

use super::models::Author;
use super::{CatalogError, Result};
use crate::db::Database;

/// Repository for authors and the book-author junction.
#[derive(Debug, Clone)]
pub struct AuthorRepository {
    db: Database,
}

impl AuthorRepository {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the existing author with this name, creating it if absent.
    ///
    /// Never creates duplicates; the insert is race-safe via
    /// `INSERT OR IGNORE` against the unique name index.
    ///
    /// # Errors
    ///
    /// [`CatalogError::InvalidRecord`] on an empty name,
    /// [`CatalogError::Database`] if the statements fail.
    #[instrument(skip(self))]
    pub async fn get_or_create(&self, name: &str) -> Result<Author> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CatalogError::invalid("author name cannot be empty"));
        }

        sqlx::query("INSERT OR IGNORE INTO authors (name) VALUES (?)")
            .bind(name)
            .execute(self.db.pool())
            .await?;

        let author = sqlx::query_as::<_, Author>("SELECT id, name FROM authors WHERE name = ?")
            .bind(name)
            .fetch_one(self.db.pool())
            .await?;

        Ok(author)
    }

    /// Links an author to a book at the given position. Idempotent: a
    /// repeated link updates the position in place.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the book or author row is missing,
    /// [`CatalogError::Database`] otherwise.
    #[instrument(skip(self))]
    pub async fn link(&self, book_id: &str, author_id: i64, position: i64) -> Result<()> {
        sqlx::query(
            r"INSERT INTO book_authors (book_id, author_id, author_order)
              VALUES (?, ?, ?)
              ON CONFLICT(book_id, author_id) DO UPDATE SET
                  author_order = excluded.author_order",
        )
        .bind(book_id)
        .bind(author_id)
        .bind(position)
        .execute(self.db.pool())
        .await
        .map_err(|e| {
            if super::is_foreign_key_violation(&e) {
                CatalogError::not_found("book or author", book_id)
            } else {
                CatalogError::Database(e)
            }
        })?;

        Ok(())
    }

    /// Returns a book's authors in positional order.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn authors_for_book(&self, book_id: &str) -> Result<Vec<Author>> {
        let authors = sqlx::query_as::<_, Author>(
            r"SELECT a.id, a.name
              FROM authors a
              JOIN book_authors ba ON ba.author_id = a.id
              WHERE ba.book_id = ?
              ORDER BY ba.author_order",
        )
        .bind(book_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(authors)
    }

    /// Returns the authors of several books with one join query.
    ///
    /// The map values preserve positional order. Books without authors are
    /// absent from the map.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self, book_ids), fields(count = book_ids.len()))]
    pub async fn authors_for_books(
        &self,
        book_ids: &[String],
    ) -> Result<HashMap<String, Vec<Author>>> {
        if book_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb = QueryBuilder::new(
            r"SELECT ba.book_id, a.id, a.name
              FROM book_authors ba
              JOIN authors a ON a.id = ba.author_id
              WHERE ba.book_id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in book_ids {
            separated.push_bind(id);
        }
        qb.push(") ORDER BY ba.book_id, ba.author_order");

        let rows: Vec<(String, i64, String)> =
            qb.build_query_as().fetch_all(self.db.pool()).await?;

        let mut map: HashMap<String, Vec<Author>> = HashMap::new();
        for (book_id, id, name) in rows {
            map.entry(book_id).or_default().push(Author { id, name });
        }
        Ok(map)
    }
}
