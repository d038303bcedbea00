//! Catalog row types and filter records.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A book row, keyed by the upstream's stable external id.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Book {
    /// External book id.
    pub id: String,
    /// Content hash used to address the file upstream.
    pub hash: String,
    /// Book title; never empty.
    pub title: String,
    /// Publication year, stored as text (callers zero-pad for ranges).
    pub year: Option<String>,
    /// Publisher name.
    pub publisher: Option<String>,
    /// Language name.
    pub language: Option<String>,
    /// File extension.
    pub extension: Option<String>,
    /// Human-readable size, e.g. "10.5 MB".
    pub size: Option<String>,
    /// Size in bytes.
    pub filesize: Option<i64>,
    /// Cover image URL.
    pub cover_url: Option<String>,
    /// Description text.
    pub description: Option<String>,
    /// ISBN.
    pub isbn: Option<String>,
    /// Edition.
    pub edition: Option<String>,
    /// Page count.
    pub pages: Option<i64>,
    /// When the row was created; set by the store.
    pub created_at: String,
    /// When the row was last updated; refreshed on upsert.
    pub updated_at: String,
}

impl Book {
    /// Creates a book with just the required fields; the store fills
    /// timestamps on insert.
    #[must_use]
    pub fn new(id: impl Into<String>, hash: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hash: hash.into(),
            title: title.into(),
            year: None,
            publisher: None,
            language: None,
            extension: None,
            size: None,
            filesize: None,
            cover_url: None,
            description: None,
            isbn: None,
            edition: None,
            pages: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

/// An author row; names are unique as stored.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Author {
    /// Surrogate id.
    pub id: i64,
    /// Author name.
    pub name: String,
}

/// A book enriched with its ordered authors.
#[derive(Debug, Clone, PartialEq)]
pub struct BookWithAuthors {
    /// The book row.
    pub book: Book,
    /// Authors in positional order.
    pub authors: Vec<Author>,
}

/// A user-created reading list.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ReadingList {
    /// Surrogate id.
    pub id: i64,
    /// Globally unique list name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
}

/// A saved-book bookmark; one per book.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SavedBook {
    /// Surrogate id.
    pub id: i64,
    /// The bookmarked book.
    pub book_id: String,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Free-form tags.
    pub tags: Option<String>,
    /// Priority; higher sorts first.
    pub priority: i64,
    /// When the bookmark was made.
    pub saved_at: String,
}

/// A saved book joined with its book row and authors for display.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedEntry {
    /// Bookmark metadata.
    pub saved: SavedBook,
    /// The book row.
    pub book: Book,
    /// Authors in positional order.
    pub authors: Vec<Author>,
}

/// Terminal status of a download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Payload written successfully.
    Completed,
    /// The attempt failed; `error_message` says why.
    Failed,
}

impl DownloadStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// A recorded download attempt; append-only.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DownloadRecord {
    /// Surrogate id.
    pub id: i64,
    /// The downloaded book.
    pub book_id: String,
    /// Identity key of the credential used, when known. Never a secret.
    pub credential_identity: Option<String>,
    /// Filename the payload was saved under.
    pub filename: String,
    /// Full path of the saved file.
    pub file_path: String,
    /// Payload size in bytes.
    pub file_size: Option<i64>,
    /// Terminal status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Failure explanation when status is failed.
    pub error_message: Option<String>,
    /// When the attempt finished.
    pub downloaded_at: String,
}

impl DownloadRecord {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Failed` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.status_str.parse().unwrap_or(DownloadStatus::Failed)
    }
}

/// A download row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewDownload<'a> {
    /// The downloaded book.
    pub book_id: &'a str,
    /// Identity key of the credential used, when known.
    pub credential_identity: Option<&'a str>,
    /// Filename the payload was saved under.
    pub filename: &'a str,
    /// Full path of the saved file.
    pub file_path: &'a str,
    /// Payload size in bytes.
    pub file_size: Option<i64>,
    /// Terminal status.
    pub status: DownloadStatus,
    /// Failure explanation when status is failed.
    pub error_message: Option<&'a str>,
}

/// A recorded search; append-only.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SearchRecord {
    /// Surrogate id.
    pub id: i64,
    /// Raw query string.
    pub search_query: String,
    /// Serialized filter record, when filters were supplied.
    pub search_filters: Option<String>,
    /// When the search ran.
    pub found_at: String,
}

/// Filters for browsing the local catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookFilters {
    /// Substring match on title.
    pub title: Option<String>,
    /// Exact match on language.
    pub language: Option<String>,
    /// Exact match on extension.
    pub extension: Option<String>,
    /// Lower bound on year (lexicographic; zero-pad as needed).
    pub year_from: Option<String>,
    /// Upper bound on year (lexicographic; zero-pad as needed).
    pub year_to: Option<String>,
    /// Substring match on author name, via join.
    pub author: Option<String>,
}

impl BookFilters {
    /// Whether no filter is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.language.is_none()
            && self.extension.is_none()
            && self.year_from.is_none()
            && self.year_to.is_none()
            && self.author.is_none()
    }
}

/// Catalog summary numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogStats {
    /// Total book rows.
    pub total_books: i64,
    /// Distinct non-null languages.
    pub distinct_languages: i64,
    /// Distinct non-null extensions.
    pub distinct_formats: i64,
    /// Total download rows.
    pub total_downloads: i64,
    /// Database file size in bytes; 0 for in-memory stores.
    pub db_file_size: u64,
}
