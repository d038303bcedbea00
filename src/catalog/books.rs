//! Book repository: CRUD, upsert by external id, and filtered search.

use sqlx::QueryBuilder;
use tracing::instrument;

use super::models::{Book, BookFilters};
use super::{CatalogError, Result};
use crate::db::Database;

/// Book column list used by every select; aliased to `b`.
const BOOK_COLUMNS: &str = "b.id, b.hash, b.title, b.year, b.publisher, b.language, \
     b.extension, b.size, b.filesize, b.cover_url, b.description, b.isbn, b.edition, \
     b.pages, b.created_at, b.updated_at";

/// Repository for book rows.
#[derive(Debug, Clone)]
pub struct BookRepository {
    db: Database,
}

impl BookRepository {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn validate(book: &Book) -> Result<()> {
        if book.id.trim().is_empty() {
            return Err(CatalogError::invalid("book id cannot be empty"));
        }
        if book.title.trim().is_empty() {
            return Err(CatalogError::invalid(format!(
                "book {} has an empty title",
                book.id
            )));
        }
        Ok(())
    }

    /// Inserts a new book row.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Duplicate`] when the id already exists,
    /// [`CatalogError::InvalidRecord`] on empty id/title.
    #[instrument(skip(self, book), fields(id = %book.id))]
    pub async fn create(&self, book: &Book) -> Result<()> {
        Self::validate(book)?;

        sqlx::query(
            r"INSERT INTO books (
                  id, hash, title, year, publisher, language, extension,
                  size, filesize, cover_url, description, isbn, edition, pages
              ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&book.id)
        .bind(&book.hash)
        .bind(&book.title)
        .bind(&book.year)
        .bind(&book.publisher)
        .bind(&book.language)
        .bind(&book.extension)
        .bind(&book.size)
        .bind(book.filesize)
        .bind(&book.cover_url)
        .bind(&book.description)
        .bind(&book.isbn)
        .bind(&book.edition)
        .bind(book.pages)
        .execute(self.db.pool())
        .await
        .map_err(|e| {
            if super::is_unique_violation(&e) {
                CatalogError::duplicate("book", &book.id)
            } else {
                CatalogError::Database(e)
            }
        })?;

        Ok(())
    }

    /// Gets a book by external id.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_by_id(&self, book_id: &str) -> Result<Option<Book>> {
        let book = sqlx::query_as::<_, Book>(&format!(
            "SELECT {BOOK_COLUMNS} FROM books b WHERE b.id = ?"
        ))
        .bind(book_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(book)
    }

    /// Gets several books by id, preserving no particular order.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    pub async fn get_many(&self, book_ids: &[String]) -> Result<Vec<Book>> {
        if book_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb =
            QueryBuilder::new(format!("SELECT {BOOK_COLUMNS} FROM books b WHERE b.id IN ("));
        let mut separated = qb.separated(", ");
        for id in book_ids {
            separated.push_bind(id);
        }
        qb.push(")");

        let books = qb.build_query_as::<Book>().fetch_all(self.db.pool()).await?;
        Ok(books)
    }

    /// Inserts the book or updates all mutable columns if the id exists.
    ///
    /// `created_at` is preserved; `updated_at` is refreshed on update.
    /// Repeated upserts of the same payload converge on the same row.
    ///
    /// # Errors
    ///
    /// [`CatalogError::InvalidRecord`] on empty id/title,
    /// [`CatalogError::Database`] if the statement fails.
    #[instrument(skip(self, book), fields(id = %book.id))]
    pub async fn upsert(&self, book: &Book) -> Result<()> {
        Self::validate(book)?;

        sqlx::query(
            r"INSERT INTO books (
                  id, hash, title, year, publisher, language, extension,
                  size, filesize, cover_url, description, isbn, edition, pages
              ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(id) DO UPDATE SET
                  hash = excluded.hash,
                  title = excluded.title,
                  year = excluded.year,
                  publisher = excluded.publisher,
                  language = excluded.language,
                  extension = excluded.extension,
                  size = excluded.size,
                  filesize = excluded.filesize,
                  cover_url = excluded.cover_url,
                  description = excluded.description,
                  isbn = excluded.isbn,
                  edition = excluded.edition,
                  pages = excluded.pages,
                  updated_at = datetime('now')",
        )
        .bind(&book.id)
        .bind(&book.hash)
        .bind(&book.title)
        .bind(&book.year)
        .bind(&book.publisher)
        .bind(&book.language)
        .bind(&book.extension)
        .bind(&book.size)
        .bind(book.filesize)
        .bind(&book.cover_url)
        .bind(&book.description)
        .bind(&book.isbn)
        .bind(&book.edition)
        .bind(book.pages)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Updates an existing book's mutable columns.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when no row has the id.
    #[instrument(skip(self, book), fields(id = %book.id))]
    pub async fn update(&self, book: &Book) -> Result<()> {
        Self::validate(book)?;

        let result = sqlx::query(
            r"UPDATE books SET
                  hash = ?, title = ?, year = ?, publisher = ?, language = ?,
                  extension = ?, size = ?, filesize = ?, cover_url = ?,
                  description = ?, isbn = ?, edition = ?, pages = ?,
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(&book.hash)
        .bind(&book.title)
        .bind(&book.year)
        .bind(&book.publisher)
        .bind(&book.language)
        .bind(&book.extension)
        .bind(&book.size)
        .bind(book.filesize)
        .bind(&book.cover_url)
        .bind(&book.description)
        .bind(&book.isbn)
        .bind(&book.edition)
        .bind(book.pages)
        .bind(&book.id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::not_found("book", &book.id));
        }
        Ok(())
    }

    /// Deletes a book; linking rows, bookmarks, and downloads cascade.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when no row has the id.
    #[instrument(skip(self))]
    pub async fn delete(&self, book_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM books WHERE id = ?")
            .bind(book_id)
            .execute(self.db.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::not_found("book", book_id));
        }
        Ok(())
    }

    /// Searches books with the fixed filter set.
    ///
    /// Ordered by title ascending with a stable id tie-break.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self, filters))]
    pub async fn search(
        &self,
        filters: &BookFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Book>> {
        let mut qb = QueryBuilder::new(format!("SELECT DISTINCT {BOOK_COLUMNS} FROM books b"));
        push_filter_clauses(&mut qb, filters);
        qb.push(" ORDER BY b.title ASC, b.id ASC LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let books = qb.build_query_as::<Book>().fetch_all(self.db.pool()).await?;
        Ok(books)
    }

    /// Counts books matching the filters.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self, filters))]
    pub async fn count(&self, filters: &BookFilters) -> Result<i64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(DISTINCT b.id) FROM books b");
        push_filter_clauses(&mut qb, filters);

        let (count,): (i64,) = qb
            .build_query_as()
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    /// Lists all books ordered by title, id. Used by export.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    pub async fn list_all(&self) -> Result<Vec<Book>> {
        let books = sqlx::query_as::<_, Book>(&format!(
            "SELECT {BOOK_COLUMNS} FROM books b ORDER BY b.title ASC, b.id ASC"
        ))
        .fetch_all(self.db.pool())
        .await?;
        Ok(books)
    }
}

/// Appends join and WHERE clauses for the filter set.
///
/// Every user value goes through a bind parameter; nothing from the
/// filters is interpolated into the SQL text.
fn push_filter_clauses(qb: &mut QueryBuilder<'_, sqlx::Sqlite>, filters: &BookFilters) {
    if filters.author.is_some() {
        qb.push(
            " LEFT JOIN book_authors ba ON ba.book_id = b.id \
              LEFT JOIN authors a ON a.id = ba.author_id",
        );
    }

    let mut has_where = false;
    let mut sep = |qb: &mut QueryBuilder<'_, sqlx::Sqlite>| {
        if has_where {
            qb.push(" AND ");
        } else {
            qb.push(" WHERE ");
            has_where = true;
        }
    };

    if let Some(title) = &filters.title {
        sep(qb);
        qb.push("b.title LIKE ");
        qb.push_bind(format!("%{title}%"));
    }
    if let Some(language) = &filters.language {
        sep(qb);
        qb.push("b.language = ");
        qb.push_bind(language.clone());
    }
    if let Some(extension) = &filters.extension {
        sep(qb);
        qb.push("b.extension = ");
        qb.push_bind(extension.clone());
    }
    if let Some(year_from) = &filters.year_from {
        sep(qb);
        qb.push("b.year >= ");
        qb.push_bind(year_from.clone());
    }
    if let Some(year_to) = &filters.year_to {
        sep(qb);
        qb.push("b.year <= ");
        qb.push_bind(year_to.clone());
    }
    if let Some(author) = &filters.author {
        sep(qb);
        qb.push("a.name LIKE ");
        qb.push_bind(format!("%{author}%"));
    }
}
