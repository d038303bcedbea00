//! Reading list repository: named lists with position-ordered membership.

use tracing::instrument;

use super::models::{Book, ReadingList};
use super::{CatalogError, Result};
use crate::db::Database;

/// Repository for reading lists and their membership rows.
#[derive(Debug, Clone)]
pub struct ReadingListRepository {
    db: Database,
}

impl ReadingListRepository {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates a new reading list.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Duplicate`] when the name is taken,
    /// [`CatalogError::InvalidRecord`] on an empty name.
    #[instrument(skip(self))]
    pub async fn create(&self, name: &str, description: Option<&str>) -> Result<ReadingList> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CatalogError::invalid("list name cannot be empty"));
        }

        let list = sqlx::query_as::<_, ReadingList>(
            r"INSERT INTO reading_lists (name, description)
              VALUES (?, ?)
              RETURNING id, name, description, created_at",
        )
        .bind(name)
        .bind(description)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| {
            if super::is_unique_violation(&e) {
                CatalogError::duplicate("reading list", name)
            } else {
                CatalogError::Database(e)
            }
        })?;

        Ok(list)
    }

    /// Gets a list by its unique name.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_by_name(&self, name: &str) -> Result<Option<ReadingList>> {
        let list = sqlx::query_as::<_, ReadingList>(
            "SELECT id, name, description, created_at FROM reading_lists WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(list)
    }

    /// Lists all reading lists ordered by name.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    pub async fn list_all(&self) -> Result<Vec<ReadingList>> {
        let lists = sqlx::query_as::<_, ReadingList>(
            "SELECT id, name, description, created_at FROM reading_lists ORDER BY name",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(lists)
    }

    /// Adds a book at the next free position. Re-adding a member book is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the book or list is missing.
    #[instrument(skip(self))]
    pub async fn add_book(&self, list_id: i64, book_id: &str) -> Result<()> {
        let (next_position,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM list_books WHERE list_id = ?",
        )
        .bind(list_id)
        .fetch_one(self.db.pool())
        .await?;

        sqlx::query(
            r"INSERT OR IGNORE INTO list_books (list_id, book_id, position)
              VALUES (?, ?, ?)",
        )
        .bind(list_id)
        .bind(book_id)
        .bind(next_position)
        .execute(self.db.pool())
        .await
        .map_err(|e| {
            if super::is_foreign_key_violation(&e) {
                CatalogError::not_found("book or reading list", book_id)
            } else {
                CatalogError::Database(e)
            }
        })?;

        Ok(())
    }

    /// Removes a book from a list.
    ///
    /// Returns whether a membership row was actually removed.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn remove_book(&self, list_id: i64, book_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM list_books WHERE list_id = ? AND book_id = ?")
            .bind(list_id)
            .bind(book_id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns the list's books in position order.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn books(&self, list_id: i64) -> Result<Vec<Book>> {
        let books = sqlx::query_as::<_, Book>(
            r"SELECT b.id, b.hash, b.title, b.year, b.publisher, b.language,
                     b.extension, b.size, b.filesize, b.cover_url, b.description,
                     b.isbn, b.edition, b.pages, b.created_at, b.updated_at
              FROM books b
              JOIN list_books lb ON lb.book_id = b.id
              WHERE lb.list_id = ?
              ORDER BY lb.position",
        )
        .bind(list_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(books)
    }

    /// Counts the books in a list.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Database`] if the query fails.
    pub async fn book_count(&self, list_id: i64) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM list_books WHERE list_id = ?")
                .bind(list_id)
                .fetch_one(self.db.pool())
                .await?;
        Ok(count)
    }

    /// Deletes a list; membership rows cascade.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when no list has the id.
    #[instrument(skip(self))]
    pub async fn delete(&self, list_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM reading_lists WHERE id = ?")
            .bind(list_id)
            .execute(self.db.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::not_found("reading list", list_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::catalog::books::BookRepository;
    use crate::catalog::models::Book;

    async fn repos() -> (BookRepository, ReadingListRepository) {
        let db = Database::open_in_memory().await.unwrap();
        (
            BookRepository::new(db.clone()),
            ReadingListRepository::new(db),
        )
    }

    #[tokio::test]
    async fn test_create_and_get_by_name() {
        let (_, lists) = repos().await;
        let created = lists.create("to-read", Some("queue")).await.unwrap();
        assert!(created.id > 0);

        let fetched = lists.get_by_name("to-read").await.unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.description.as_deref(), Some("queue"));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (_, lists) = repos().await;
        lists.create("dup", None).await.unwrap();
        let err = lists.create("dup", None).await.unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_add_book_assigns_positions_in_order() {
        let (books, lists) = repos().await;
        for (id, title) in [("A", "One"), ("B", "Two"), ("C", "Three")] {
            books.create(&Book::new(id, "h", title)).await.unwrap();
        }
        let list = lists.create("ordered", None).await.unwrap();

        lists.add_book(list.id, "B").await.unwrap();
        lists.add_book(list.id, "A").await.unwrap();
        lists.add_book(list.id, "C").await.unwrap();

        let members = lists.books(list.id).await.unwrap();
        let ids: Vec<&str> = members.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, ["B", "A", "C"]);
    }

    #[tokio::test]
    async fn test_add_book_twice_is_noop() {
        let (books, lists) = repos().await;
        books.create(&Book::new("A", "h", "T")).await.unwrap();
        let list = lists.create("l", None).await.unwrap();

        lists.add_book(list.id, "A").await.unwrap();
        lists.add_book(list.id, "A").await.unwrap();
        assert_eq!(lists.book_count(list.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_missing_book_is_not_found() {
        let (_, lists) = repos().await;
        let list = lists.create("l", None).await.unwrap();
        let err = lists.add_book(list.id, "ghost").await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_book_reports_membership() {
        let (books, lists) = repos().await;
        books.create(&Book::new("A", "h", "T")).await.unwrap();
        let list = lists.create("l", None).await.unwrap();
        lists.add_book(list.id, "A").await.unwrap();

        assert!(lists.remove_book(list.id, "A").await.unwrap());
        assert!(!lists.remove_book(list.id, "A").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_list_cascades_membership() {
        let (books, lists) = repos().await;
        books.create(&Book::new("A", "h", "T")).await.unwrap();
        let list = lists.create("l", None).await.unwrap();
        lists.add_book(list.id, "A").await.unwrap();

        lists.delete(list.id).await.unwrap();
        assert!(lists.get_by_name("l").await.unwrap().is_none());
        assert_eq!(lists.book_count(list.id).await.unwrap(), 0);

        // The book itself survives.
        assert!(books.get_by_id("A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_all_orders_by_name() {
        let (_, lists) = repos().await;
        lists.create("zeta", None).await.unwrap();
        lists.create("alpha", None).await.unwrap();

        let all = lists.list_all().await.unwrap();
        let names: Vec<&str> = all.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }
}
