//! Search-result ingestion: upstream records become catalog rows.
//!
//! Ingestion upserts each book by external id, splits its author string
//! into ordered names, links the authors, and records the search in the
//! history. Re-ingesting the same record converges on the same state.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, instrument, warn};

use super::models::Book;
use super::service::CatalogService;
use super::{CatalogError, Result};
use crate::upstream::RemoteBook;

/// Outcome counts for one ingestion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Records upserted into the catalog.
    pub stored: usize,
    /// Records skipped for missing id or title.
    pub skipped: usize,
}

#[allow(clippy::expect_used)]
fn and_splitter() -> &'static Regex {
    static AND_SPLIT: OnceLock<Regex> = OnceLock::new();
    AND_SPLIT.get_or_init(|| {
        Regex::new(r"(?i)\s+and\s+|\s+&\s+").expect("author splitter pattern is valid")
    })
}

/// Splits a raw author string into ordered author names.
///
/// Separators are `,`, `;`, and the words ` and `/` & ` (case-insensitive,
/// whitespace-delimited). Names are trimmed and empties dropped. The split
/// is deliberately simple: "Smith, John" becomes two names; callers that
/// need surname grouping must pre-normalize.
#[must_use]
pub fn split_authors(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .flat_map(|part| and_splitter().split(part))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Converts an upstream record into a catalog row.
///
/// # Errors
///
/// [`CatalogError::InvalidRecord`] when the id or title is empty.
pub fn book_from_remote(remote: &RemoteBook) -> Result<Book> {
    if remote.id.trim().is_empty() {
        return Err(CatalogError::invalid("search result has no id"));
    }
    if remote.title.trim().is_empty() {
        return Err(CatalogError::invalid(format!(
            "search result {} has no title",
            remote.id
        )));
    }

    let mut book = Book::new(&remote.id, &remote.hash, &remote.title);
    book.year = remote.year.clone();
    book.publisher = remote.publisher.clone();
    book.language = remote.language.clone();
    book.extension = remote.extension.clone();
    book.size = remote.size.clone();
    book.filesize = remote.filesize;
    book.cover_url = remote.cover.clone();
    book.description = remote.description.clone();
    book.isbn = remote.isbn.clone();
    book.edition = remote.edition.clone();
    book.pages = remote.pages;
    Ok(book)
}

impl CatalogService {
    /// Ingests one page of search results and records the search.
    ///
    /// # Errors
    ///
    /// Propagates store failures; invalid records are skipped, not fatal.
    #[instrument(skip(self, books, filters_json), fields(count = books.len()))]
    pub async fn ingest_search_results(
        &self,
        query: &str,
        filters_json: Option<&str>,
        books: &[RemoteBook],
    ) -> Result<IngestSummary> {
        let summary = self.ingest_books(books).await?;
        self.history().record(query, filters_json).await?;
        Ok(summary)
    }

    /// Ingests search results without touching the search history.
    ///
    /// Used for the later pages of an all-pages search, which share one
    /// history row with the first page.
    ///
    /// # Errors
    ///
    /// Propagates store failures; invalid records are skipped, not fatal.
    #[instrument(skip(self, books), fields(count = books.len()))]
    pub async fn ingest_books(&self, books: &[RemoteBook]) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();

        for remote in books {
            let book = match book_from_remote(remote) {
                Ok(book) => book,
                Err(error) => {
                    warn!(%error, "skipping invalid search result");
                    summary.skipped += 1;
                    continue;
                }
            };

            self.books().upsert(&book).await?;

            if let Some(raw_authors) = remote.author.as_deref() {
                for (position, name) in split_authors(raw_authors).iter().enumerate() {
                    let author = self.authors().get_or_create(name).await?;
                    self.authors()
                        .link(&book.id, author.id, position as i64)
                        .await?;
                }
            }

            summary.stored += 1;
        }

        debug!(stored = summary.stored, skipped = summary.skipped, "ingestion finished");
        Ok(summary)
    }
}
