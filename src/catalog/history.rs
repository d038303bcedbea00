//! Search history repository: append-only record of searches.

use sqlx::Row;
use tracing::instrument;

use super::Result;
use super::models::SearchRecord;
use crate::db::Database;

/// Repository for search history rows.
#[derive(Debug, Clone)]
pub struct SearchHistoryRepository {
    db: Database,
}

impl SearchHistoryRepository {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Appends a search record.
    ///
    /// # Returns
    ///
    /// The id of the new row.
    ///
    /// # Errors
    ///
    /// [`super::CatalogError::Database`] if the insert fails.
    #[instrument(skip(self, filters_json))]
    pub async fn record(&self, query: &str, filters_json: Option<&str>) -> Result<i64> {
        let row = sqlx::query(
            r"INSERT INTO search_history (search_query, search_filters)
              VALUES (?, ?)
              RETURNING id",
        )
        .bind(query)
        .bind(filters_json)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get("id"))
    }

    /// Lists the most recent searches.
    ///
    /// # Errors
    ///
    /// [`super::CatalogError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<SearchRecord>> {
        let records = sqlx::query_as::<_, SearchRecord>(
            r"SELECT id, search_query, search_filters, found_at
              FROM search_history
              ORDER BY found_at DESC, id DESC
              LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Counts all search rows.
    ///
    /// # Errors
    ///
    /// [`super::CatalogError::Database`] if the query fails.
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM search_history")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn repo() -> SearchHistoryRepository {
        let db = Database::open_in_memory().await.unwrap();
        SearchHistoryRepository::new(db)
    }

    #[tokio::test]
    async fn test_record_and_list() {
        let repo = repo().await;
        repo.record("rust async", Some(r#"{"language":"English"}"#))
            .await
            .unwrap();
        repo.record("tokio", None).await.unwrap();

        let recent = repo.list_recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].search_query, "tokio");
        assert!(recent[0].search_filters.is_none());
        assert_eq!(
            recent[1].search_filters.as_deref(),
            Some(r#"{"language":"English"}"#)
        );
    }

    #[tokio::test]
    async fn test_quotes_in_query_stored_verbatim() {
        let repo = repo().await;
        let hostile = "'; DELETE FROM search_history; --";
        repo.record(hostile, None).await.unwrap();

        let recent = repo.list_recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].search_query, hostile);
    }

    #[tokio::test]
    async fn test_list_recent_respects_limit() {
        let repo = repo().await;
        for i in 0..5 {
            repo.record(&format!("query {i}"), None).await.unwrap();
        }
        assert_eq!(repo.list_recent(2).await.unwrap().len(), 2);
        assert_eq!(repo.count().await.unwrap(), 5);
    }
}
