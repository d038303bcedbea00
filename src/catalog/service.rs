//! Catalog service: multi-repository operations behind one handle.

use tracing::instrument;

use super::authors::AuthorRepository;
use super::books::BookRepository;
use super::downloads::DownloadRepository;
use super::history::SearchHistoryRepository;
use super::lists::ReadingListRepository;
use super::models::{
    Book, BookFilters, BookWithAuthors, CatalogStats, DownloadRecord, NewDownload, ReadingList,
    SavedEntry, SearchRecord,
};
use super::saved::SavedBookRepository;
use super::{CatalogError, Result};
use crate::db::Database;

/// Orchestrates operations that span multiple repositories.
#[derive(Debug, Clone)]
pub struct CatalogService {
    db: Database,
    books: BookRepository,
    authors: AuthorRepository,
    lists: ReadingListRepository,
    saved: SavedBookRepository,
    downloads: DownloadRepository,
    history: SearchHistoryRepository,
}

impl CatalogService {
    /// Creates the service and its repositories over one database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            books: BookRepository::new(db.clone()),
            authors: AuthorRepository::new(db.clone()),
            lists: ReadingListRepository::new(db.clone()),
            saved: SavedBookRepository::new(db.clone()),
            downloads: DownloadRepository::new(db.clone()),
            history: SearchHistoryRepository::new(db.clone()),
            db,
        }
    }

    /// The underlying database handle.
    #[must_use]
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// The book repository.
    #[must_use]
    pub fn books(&self) -> &BookRepository {
        &self.books
    }

    /// The author repository.
    #[must_use]
    pub fn authors(&self) -> &AuthorRepository {
        &self.authors
    }

    /// The reading list repository.
    #[must_use]
    pub fn lists(&self) -> &ReadingListRepository {
        &self.lists
    }

    /// The saved-book repository.
    #[must_use]
    pub fn saved(&self) -> &SavedBookRepository {
        &self.saved
    }

    /// The download repository.
    #[must_use]
    pub fn downloads(&self) -> &DownloadRepository {
        &self.downloads
    }

    /// The search history repository.
    #[must_use]
    pub fn history(&self) -> &SearchHistoryRepository {
        &self.history
    }

    /// Browses the catalog, enriching each book with its authors.
    ///
    /// Authors for the whole page come from a single join query.
    ///
    /// # Errors
    ///
    /// Store failures surface as [`CatalogError::Database`].
    #[instrument(skip(self, filters))]
    pub async fn browse(
        &self,
        filters: &BookFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BookWithAuthors>> {
        let books = self.books.search(filters, limit, offset).await?;
        self.attach_authors(books).await
    }

    /// Counts books matching the filters.
    ///
    /// # Errors
    ///
    /// Store failures surface as [`CatalogError::Database`].
    pub async fn count(&self, filters: &BookFilters) -> Result<i64> {
        self.books.count(filters).await
    }

    /// Shows one book with its authors.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the book does not exist.
    #[instrument(skip(self))]
    pub async fn show(&self, book_id: &str) -> Result<BookWithAuthors> {
        let book = self
            .books
            .get_by_id(book_id)
            .await?
            .ok_or_else(|| CatalogError::not_found("book", book_id))?;
        let authors = self.authors.authors_for_book(book_id).await?;
        Ok(BookWithAuthors { book, authors })
    }

    /// Bookmarks a book with notes, tags, and priority.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the book does not exist.
    #[instrument(skip(self, notes, tags))]
    pub async fn save_book(
        &self,
        book_id: &str,
        notes: Option<&str>,
        tags: Option<&str>,
        priority: i64,
    ) -> Result<()> {
        self.saved.save(book_id, notes, tags, priority).await
    }

    /// Removes a bookmark; returns whether one existed.
    ///
    /// # Errors
    ///
    /// Store failures surface as [`CatalogError::Database`].
    pub async fn unsave_book(&self, book_id: &str) -> Result<bool> {
        self.saved.unsave(book_id).await
    }

    /// Lists bookmarks with their books and authors.
    ///
    /// # Errors
    ///
    /// Store failures surface as [`CatalogError::Database`].
    #[instrument(skip(self))]
    pub async fn saved_books(&self) -> Result<Vec<SavedEntry>> {
        let saved = self.saved.list_all().await?;
        let ids: Vec<String> = saved.iter().map(|s| s.book_id.clone()).collect();

        let books = self.books.get_many(&ids).await?;
        let mut authors = self.authors.authors_for_books(&ids).await?;

        let mut entries = Vec::with_capacity(saved.len());
        for bookmark in saved {
            let Some(book) = books.iter().find(|b| b.id == bookmark.book_id).cloned() else {
                continue;
            };
            let authors = authors.remove(&bookmark.book_id).unwrap_or_default();
            entries.push(SavedEntry {
                saved: bookmark,
                book,
                authors,
            });
        }
        Ok(entries)
    }

    /// Creates a reading list.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Duplicate`] on a name collision.
    pub async fn create_list(&self, name: &str, description: Option<&str>) -> Result<ReadingList> {
        self.lists.create(name, description).await
    }

    /// Deletes a reading list by name.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when no list has the name.
    #[instrument(skip(self))]
    pub async fn delete_list(&self, name: &str) -> Result<()> {
        let list = self.require_list(name).await?;
        self.lists.delete(list.id).await
    }

    /// Adds a book to a named list.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the list or book is missing.
    #[instrument(skip(self))]
    pub async fn add_to_list(&self, name: &str, book_id: &str) -> Result<()> {
        let list = self.require_list(name).await?;
        if self.books.get_by_id(book_id).await?.is_none() {
            return Err(CatalogError::not_found("book", book_id));
        }
        self.lists.add_book(list.id, book_id).await
    }

    /// Removes a book from a named list; returns whether it was a member.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the list is missing.
    #[instrument(skip(self))]
    pub async fn remove_from_list(&self, name: &str, book_id: &str) -> Result<bool> {
        let list = self.require_list(name).await?;
        self.lists.remove_book(list.id, book_id).await
    }

    /// Returns a named list and its books (with authors) in position order.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the list is missing.
    #[instrument(skip(self))]
    pub async fn list_with_books(
        &self,
        name: &str,
    ) -> Result<(ReadingList, Vec<BookWithAuthors>)> {
        let list = self.require_list(name).await?;
        let books = self.lists.books(list.id).await?;
        let enriched = self.attach_authors(books).await?;
        Ok((list, enriched))
    }

    /// Lists every reading list with its book count.
    ///
    /// # Errors
    ///
    /// Store failures surface as [`CatalogError::Database`].
    pub async fn all_lists(&self) -> Result<Vec<(ReadingList, i64)>> {
        let lists = self.lists.list_all().await?;
        let mut out = Vec::with_capacity(lists.len());
        for list in lists {
            let count = self.lists.book_count(list.id).await?;
            out.push((list, count));
        }
        Ok(out)
    }

    /// Records a download attempt.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the book row is missing.
    pub async fn record_download(&self, download: &NewDownload<'_>) -> Result<i64> {
        self.downloads.record(download).await
    }

    /// Lists the most recent downloads.
    ///
    /// # Errors
    ///
    /// Store failures surface as [`CatalogError::Database`].
    pub async fn recent_downloads(&self, limit: i64) -> Result<Vec<DownloadRecord>> {
        self.downloads.list_recent(limit).await
    }

    /// Lists the most recent searches.
    ///
    /// # Errors
    ///
    /// Store failures surface as [`CatalogError::Database`].
    pub async fn recent_searches(&self, limit: i64) -> Result<Vec<SearchRecord>> {
        self.history.list_recent(limit).await
    }

    /// Computes catalog summary numbers.
    ///
    /// # Errors
    ///
    /// Store failures surface as [`CatalogError::Database`].
    #[instrument(skip(self))]
    pub async fn stats(&self) -> Result<CatalogStats> {
        let (total_books,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM books")
            .fetch_one(self.db.pool())
            .await?;
        let (distinct_languages,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT language) FROM books WHERE language IS NOT NULL",
        )
        .fetch_one(self.db.pool())
        .await?;
        let (distinct_formats,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT extension) FROM books WHERE extension IS NOT NULL",
        )
        .fetch_one(self.db.pool())
        .await?;
        let total_downloads = self.downloads.count().await?;

        Ok(CatalogStats {
            total_books,
            distinct_languages,
            distinct_formats,
            total_downloads,
            db_file_size: self.db.file_size(),
        })
    }

    /// Compacts the store.
    ///
    /// # Errors
    ///
    /// Store failures surface as [`CatalogError::Database`].
    #[instrument(skip(self))]
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(self.db.pool()).await?;
        Ok(())
    }

    async fn require_list(&self, name: &str) -> Result<ReadingList> {
        self.lists
            .get_by_name(name)
            .await?
            .ok_or_else(|| CatalogError::not_found("reading list", name))
    }

    async fn attach_authors(&self, books: Vec<Book>) -> Result<Vec<BookWithAuthors>> {
        let ids: Vec<String> = books.iter().map(|b| b.id.clone()).collect();
        let mut authors = self.authors.authors_for_books(&ids).await?;

        Ok(books
            .into_iter()
            .map(|book| {
                let authors = authors.remove(&book.id).unwrap_or_default();
                BookWithAuthors { book, authors }
            })
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::catalog::models::DownloadStatus;

    async fn service() -> CatalogService {
        let db = Database::open_in_memory().await.unwrap();
        CatalogService::new(db)
    }

    async fn seed_book(service: &CatalogService, id: &str, title: &str, authors: &[&str]) {
        service
            .books()
            .upsert(&Book::new(id, "hash", title))
            .await
            .unwrap();
        for (position, name) in authors.iter().enumerate() {
            let author = service.authors().get_or_create(name).await.unwrap();
            service
                .authors()
                .link(id, author.id, position as i64)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_browse_attaches_ordered_authors() {
        let service = service().await;
        seed_book(&service, "A", "First", &["X", "Y"]).await;
        seed_book(&service, "B", "Second", &["X"]).await;

        let page = service
            .browse(&BookFilters::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let first = page.iter().find(|b| b.book.id == "A").unwrap();
        let names: Vec<&str> = first.authors.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["X", "Y"]);
    }

    #[tokio::test]
    async fn test_show_missing_book_is_not_found() {
        let service = service().await;
        let err = service.show("ghost").await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_save_and_saved_books_listing() {
        let service = service().await;
        seed_book(&service, "A", "Title", &["X"]).await;

        service
            .save_book("A", Some("notes"), Some("tag"), 2)
            .await
            .unwrap();

        let saved = service.saved_books().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].book.id, "A");
        assert_eq!(saved[0].saved.notes.as_deref(), Some("notes"));
        assert_eq!(saved[0].authors[0].name, "X");

        assert!(service.unsave_book("A").await.unwrap());
        assert!(service.saved_books().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_management_round_trip() {
        let service = service().await;
        seed_book(&service, "A", "Title", &[]).await;

        service.create_list("queue", Some("to read")).await.unwrap();
        service.add_to_list("queue", "A").await.unwrap();

        let (list, books) = service.list_with_books("queue").await.unwrap();
        assert_eq!(list.name, "queue");
        assert_eq!(books.len(), 1);

        let all = service.all_lists().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1, 1);

        assert!(service.remove_from_list("queue", "A").await.unwrap());
        service.delete_list("queue").await.unwrap();
        assert!(matches!(
            service.list_with_books("queue").await.unwrap_err(),
            CatalogError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_add_to_missing_list_or_book_fails() {
        let service = service().await;
        assert!(matches!(
            service.add_to_list("nope", "A").await.unwrap_err(),
            CatalogError::NotFound { .. }
        ));

        service.create_list("real", None).await.unwrap();
        assert!(matches!(
            service.add_to_list("real", "ghost").await.unwrap_err(),
            CatalogError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_list_name_surfaces() {
        let service = service().await;
        service.create_list("dup", None).await.unwrap();
        assert!(matches!(
            service.create_list("dup", None).await.unwrap_err(),
            CatalogError::Duplicate { .. }
        ));
    }

    #[tokio::test]
    async fn test_stats_counts_entities() {
        let service = service().await;
        let mut book = Book::new("A", "h", "T");
        book.language = Some("English".to_string());
        book.extension = Some("pdf".to_string());
        service.books().upsert(&book).await.unwrap();

        service
            .record_download(&NewDownload {
                book_id: "A",
                credential_identity: None,
                filename: "f.pdf",
                file_path: "/tmp/f.pdf",
                file_size: Some(10),
                status: DownloadStatus::Completed,
                error_message: None,
            })
            .await
            .unwrap();

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.total_books, 1);
        assert_eq!(stats.distinct_languages, 1);
        assert_eq!(stats.distinct_formats, 1);
        assert_eq!(stats.total_downloads, 1);
    }

    #[tokio::test]
    async fn test_vacuum_succeeds() {
        let service = service().await;
        service.vacuum().await.unwrap();
    }

    #[tokio::test]
    async fn test_book_delete_cascades_everywhere() {
        let service = service().await;
        seed_book(&service, "A", "Title", &["X"]).await;
        service.save_book("A", None, None, 0).await.unwrap();
        service.create_list("l", None).await.unwrap();
        service.add_to_list("l", "A").await.unwrap();
        service
            .record_download(&NewDownload {
                book_id: "A",
                credential_identity: Some("id"),
                filename: "f.pdf",
                file_path: "/tmp/f.pdf",
                file_size: None,
                status: DownloadStatus::Completed,
                error_message: None,
            })
            .await
            .unwrap();

        service.books().delete("A").await.unwrap();

        let pool = service.db().pool();
        for table in ["book_authors", "list_books", "saved_books", "downloads"] {
            let (count,): (i64,) =
                sqlx::query_as(&format!("SELECT COUNT(*) FROM {table} WHERE book_id = 'A'"))
                    .fetch_one(pool)
                    .await
                    .unwrap();
            assert_eq!(count, 0, "stale rows left in {table}");
        }
    }
}
