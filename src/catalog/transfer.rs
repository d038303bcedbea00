//! Catalog import and export.
//!
//! Export serializes the full book set (with authors) as a JSON array or
//! a fixed-column CSV. Import reads the JSON shape back and re-runs the
//! ingestion path inside a single transaction; a malformed element aborts
//! the whole import with no partial writes.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::service::CatalogService;
use super::{CatalogError, Result};

/// CSV header; the column order is part of the export contract.
const CSV_HEADER: &str = "id,title,authors,year,publisher,language,extension,filesize,isbn";

/// One book in the export/import JSON shape.
///
/// `id` and `title` are required on import; everything else defaults.
/// Unknown keys in import payloads are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedBook {
    /// External book id. Required.
    pub id: String,
    /// Book title. Required.
    pub title: String,
    /// Ordered author names.
    #[serde(default)]
    pub authors: Vec<String>,
    /// Content hash.
    #[serde(default)]
    pub hash: String,
    /// Publication year.
    #[serde(default)]
    pub year: Option<String>,
    /// Publisher name.
    #[serde(default)]
    pub publisher: Option<String>,
    /// Language name.
    #[serde(default)]
    pub language: Option<String>,
    /// File extension.
    #[serde(default)]
    pub extension: Option<String>,
    /// Human-readable size.
    #[serde(default)]
    pub size: Option<String>,
    /// Size in bytes.
    #[serde(default)]
    pub filesize: Option<i64>,
    /// Cover image URL.
    #[serde(default)]
    pub cover_url: Option<String>,
    /// Description text.
    #[serde(default)]
    pub description: Option<String>,
    /// ISBN.
    #[serde(default)]
    pub isbn: Option<String>,
    /// Edition.
    #[serde(default)]
    pub edition: Option<String>,
    /// Page count.
    #[serde(default)]
    pub pages: Option<i64>,
}

impl CatalogService {
    async fn exported_books(&self) -> Result<Vec<ExportedBook>> {
        let books = self.books().list_all().await?;
        let ids: Vec<String> = books.iter().map(|b| b.id.clone()).collect();
        let mut authors = self.authors().authors_for_books(&ids).await?;

        Ok(books
            .into_iter()
            .map(|book| ExportedBook {
                authors: authors
                    .remove(&book.id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|a| a.name)
                    .collect(),
                id: book.id,
                title: book.title,
                hash: book.hash,
                year: book.year,
                publisher: book.publisher,
                language: book.language,
                extension: book.extension,
                size: book.size,
                filesize: book.filesize,
                cover_url: book.cover_url,
                description: book.description,
                isbn: book.isbn,
                edition: book.edition,
                pages: book.pages,
            })
            .collect())
    }

    /// Exports the full book set as a JSON array with nested author
    /// arrays.
    ///
    /// # Errors
    ///
    /// Store failures surface as [`CatalogError::Database`].
    #[instrument(skip(self))]
    pub async fn export_json(&self) -> Result<String> {
        let books = self.exported_books().await?;
        serde_json::to_string_pretty(&books)
            .map_err(|e| CatalogError::invalid(format!("export serialization failed: {e}")))
    }

    /// Exports the full book set as CSV with the declared column order.
    ///
    /// Authors are joined with `;`.
    ///
    /// # Errors
    ///
    /// Store failures surface as [`CatalogError::Database`].
    #[instrument(skip(self))]
    pub async fn export_csv(&self) -> Result<String> {
        let books = self.exported_books().await?;

        let mut out = String::with_capacity(books.len() * 80 + CSV_HEADER.len() + 1);
        out.push_str(CSV_HEADER);
        out.push('\n');

        for book in books {
            let filesize = book.filesize.map(|n| n.to_string()).unwrap_or_default();
            let row = [
                book.id.as_str(),
                book.title.as_str(),
                &book.authors.join(";"),
                book.year.as_deref().unwrap_or(""),
                book.publisher.as_deref().unwrap_or(""),
                book.language.as_deref().unwrap_or(""),
                book.extension.as_deref().unwrap_or(""),
                filesize.as_str(),
                book.isbn.as_deref().unwrap_or(""),
            ];
            let escaped: Vec<String> = row.iter().map(|field| csv_field(field)).collect();
            out.push_str(&escaped.join(","));
            out.push('\n');
        }
        Ok(out)
    }

    /// Imports a JSON array of books inside a single transaction.
    ///
    /// Each element runs through the ingestion path (upsert book, get or
    /// create each author, link in order). Any element missing `id` or
    /// `title` aborts the whole import; nothing is written. Unknown keys
    /// are ignored.
    ///
    /// # Returns
    ///
    /// The number of imported books.
    ///
    /// # Errors
    ///
    /// [`CatalogError::InvalidRecord`] for malformed payloads,
    /// [`CatalogError::Database`] for store failures. Both roll back.
    #[instrument(skip(self, raw), fields(bytes = raw.len()))]
    pub async fn import_json(&self, raw: &str) -> Result<usize> {
        let elements: Vec<serde_json::Value> = serde_json::from_str(raw)
            .map_err(|e| CatalogError::invalid(format!("expected a top-level JSON array: {e}")))?;

        let mut books = Vec::with_capacity(elements.len());
        for (index, element) in elements.into_iter().enumerate() {
            let book: ExportedBook = serde_json::from_value(element)
                .map_err(|e| CatalogError::invalid(format!("element {index}: {e}")))?;
            if book.id.trim().is_empty() {
                return Err(CatalogError::invalid(format!("element {index}: empty id")));
            }
            if book.title.trim().is_empty() {
                return Err(CatalogError::invalid(format!(
                    "element {index}: empty title"
                )));
            }
            books.push(book);
        }

        let mut tx = self.db().pool().begin().await?;

        for book in &books {
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
            .execute(&mut *tx)
            .await?;

            for (position, name) in book.authors.iter().enumerate() {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }

                sqlx::query("INSERT OR IGNORE INTO authors (name) VALUES (?)")
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
                let (author_id,): (i64,) =
                    sqlx::query_as("SELECT id FROM authors WHERE name = ?")
                        .bind(name)
                        .fetch_one(&mut *tx)
                        .await?;

                sqlx::query(
                    r"INSERT INTO book_authors (book_id, author_id, author_order)
                      VALUES (?, ?, ?)
                      ON CONFLICT(book_id, author_id) DO UPDATE SET
                          author_order = excluded.author_order",
                )
                .bind(&book.id)
                .bind(author_id)
                .bind(position as i64)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        info!(imported = books.len(), "import committed");
        Ok(books.len())
    }
}

/// Quotes a CSV field when it contains a delimiter, quote, or newline.
fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
