//! Search/download engine: drives upstream operations through the
//! session pool, applies the retry and rotation policy, and records
//! results in the catalog.
//!
//! # Policy
//!
//! - One upstream retry per credential for transient failures, then the
//!   pool rotates; an operation makes at most one attempt per configured
//!   credential before failing.
//! - Auth errors refresh the session once; a second rejection marks the
//!   credential invalid and moves on.
//! - Quota signals mark the credential exhausted and move on.
//! - A successful operation advances the rotation cursor by one step.
//! - Download failures at the payload step record a failed row, leave
//!   the quota and the cursor untouched, and surface the error.
//! - Every externally blocking call honors a cancellation token; a
//!   cancelled download leaves any partial file but records nothing.

pub mod filename;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::{CredentialError, ProbeOutcome};
use crate::catalog::{CatalogError, CatalogService, DownloadStatus, NewDownload};
use crate::upstream::{
    RemoteBook, SearchFilters, SessionError, SessionPool, UpstreamError, UpstreamSession,
};

/// Default page size when the filters do not set one.
const DEFAULT_PAGE_SIZE: u32 = 50;

/// Page size bounds accepted by the upstream service.
const PAGE_SIZE_RANGE: std::ops::RangeInclusive<u32> = 1..=100;

/// Default delay before the single per-credential retry.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Maximum jitter added to the retry delay.
const MAX_RETRY_JITTER_MS: u64 = 250;

/// Errors from fetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The requested page size is outside 1..=100.
    #[error("invalid search limit {limit}: must be between 1 and 100")]
    InvalidLimit {
        /// The rejected value.
        limit: u32,
    },

    /// The book record is missing fields needed for the operation.
    #[error("book record incomplete: {reason}")]
    InvalidBook {
        /// What is missing.
        reason: String,
    },

    /// No credential could serve the operation.
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// The upstream failed after all credentials were tried.
    #[error(transparent)]
    Upstream(UpstreamError),

    /// Recording results in the catalog failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<SessionError> for FetchError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Credential(inner) => Self::Credentials(inner),
            SessionError::Login { source, .. } => Self::Upstream(source),
            SessionError::UnknownIdentity { identity } => Self::Upstream(
                UpstreamError::invalid_response(format!("unknown credential '{identity}'")),
            ),
        }
    }
}

/// Outcome of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// External id of the downloaded book.
    pub book_id: String,
    /// Filename the payload was saved under.
    pub filename: String,
    /// Full path of the saved file.
    pub path: PathBuf,
    /// Bytes written.
    pub bytes: u64,
}

/// Tuning knobs for the retry policy.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Base delay before the single per-credential retry.
    pub retry_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Drives searches and downloads over the session pool.
#[derive(Debug)]
pub struct FetchEngine {
    pool: SessionPool,
    catalog: CatalogService,
    config: FetchConfig,
}

impl FetchEngine {
    /// Creates an engine over a session pool and a catalog.
    #[must_use]
    pub fn new(pool: SessionPool, catalog: CatalogService, config: FetchConfig) -> Self {
        Self {
            pool,
            catalog,
            config,
        }
    }

    /// Read access to the session pool.
    #[must_use]
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Write access to the session pool (validation, status marking).
    pub fn pool_mut(&mut self) -> &mut SessionPool {
        &mut self.pool
    }

    /// The catalog this engine records into.
    #[must_use]
    pub fn catalog(&self) -> &CatalogService {
        &self.catalog
    }

    /// Searches one page, optionally ingesting the results.
    ///
    /// # Errors
    ///
    /// [`FetchError::InvalidLimit`] on a bad page size; upstream errors
    /// surface only after every credential has been tried.
    #[instrument(skip(self, filters, cancel), fields(query = %query))]
    pub async fn search(
        &mut self,
        query: &str,
        filters: &SearchFilters,
        save: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteBook>, FetchError> {
        let limit = validated_limit(filters)?;
        let page = filters.page.unwrap_or(1);

        let books = self.search_page(query, filters, page, limit, cancel).await?;

        if save {
            let filters_json = filters_json(filters);
            self.catalog
                .ingest_search_results(query, filters_json.as_deref(), &books)
                .await?;
        }
        Ok(books)
    }

    /// Searches every page until the upstream returns a short page,
    /// optionally ingesting as it goes.
    ///
    /// Rotation between pages follows from the post-operation advance.
    /// Cancellation keeps already-ingested pages and returns
    /// [`FetchError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Same as [`search`](Self::search).
    #[instrument(skip(self, filters, cancel), fields(query = %query))]
    pub async fn search_all_pages(
        &mut self,
        query: &str,
        filters: &SearchFilters,
        save: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteBook>, FetchError> {
        let limit = validated_limit(filters)?;

        let mut all = Vec::new();
        let mut page: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let books = self.search_page(query, filters, page, limit, cancel).await?;

            if save {
                if page == 1 {
                    let filters_json = filters_json(filters);
                    self.catalog
                        .ingest_search_results(query, filters_json.as_deref(), &books)
                        .await?;
                } else {
                    self.catalog.ingest_books(&books).await?;
                }
            }

            let count = books.len();
            all.extend(books);
            debug!(page, count, "page fetched");
            if count < limit as usize {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    /// Searches every page, ingests the results, and downloads each
    /// found book into `dest_dir`.
    ///
    /// Individual download failures are recorded and skipped; the batch
    /// stops early only when every credential is exhausted or the caller
    /// cancels.
    ///
    /// # Errors
    ///
    /// Same as [`search_all_pages`](Self::search_all_pages) plus
    /// [`CredentialError::AllCredentialsExhausted`] mid-batch.
    #[instrument(skip(self, filters, cancel), fields(query = %query))]
    pub async fn download_all_pages(
        &mut self,
        query: &str,
        filters: &SearchFilters,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<DownloadOutcome>, FetchError> {
        let books = self.search_all_pages(query, filters, true, cancel).await?;

        let mut outcomes = Vec::with_capacity(books.len());
        for book in &books {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            match self.download(book, dest_dir, cancel).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(FetchError::Credentials(CredentialError::AllCredentialsExhausted)) => {
                    return Err(FetchError::Credentials(
                        CredentialError::AllCredentialsExhausted,
                    ));
                }
                Err(error) => {
                    warn!(book_id = %book.id, %error, "download failed, continuing batch");
                }
            }
        }
        Ok(outcomes)
    }

    /// Downloads a book payload into `dest_dir`.
    ///
    /// On success a completed row is recorded, the credential's quota is
    /// decremented, and the cursor advances one step. On payload or write
    /// failure a failed row is recorded, the quota and cursor stay
    /// untouched, and the error surfaces.
    ///
    /// # Errors
    ///
    /// [`FetchError::Credentials`] when no credential is available (no
    /// row is recorded), [`FetchError::Cancelled`] on cancellation (no
    /// row; a partial file may remain), upstream/catalog errors
    /// otherwise.
    #[instrument(skip(self, cancel), fields(book_id = %book.id))]
    pub async fn download(
        &mut self,
        book: &RemoteBook,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, FetchError> {
        if book.id.trim().is_empty() {
            return Err(FetchError::InvalidBook {
                reason: "missing id".to_string(),
            });
        }
        if book.hash.trim().is_empty() {
            return Err(FetchError::InvalidBook {
                reason: "missing hash".to_string(),
            });
        }

        // All-exhausted fails before anything is recorded.
        let (credential, session) = self.acquire_session(cancel).await?;
        let identity = credential.identity().to_string();

        // The download row references the book row; make sure it exists.
        self.catalog.ingest_books(std::slice::from_ref(book)).await?;

        let file = match self
            .resolve_file(&session, &identity, &book.id, &book.hash, cancel)
            .await
        {
            Ok(file) => file,
            Err(FetchError::Upstream(error)) => {
                self.record_failed(&book.id, &identity, &error).await?;
                return Err(FetchError::Upstream(error));
            }
            Err(other) => return Err(other),
        };

        let name = filename::build_filename(&file, &book.id, book.extension.as_deref());
        let path = filename::resolve_unique_path(dest_dir, &name);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(name);

        let link = file.download_link.as_deref().unwrap_or_default();
        let bytes = tokio::select! {
            () = cancel.cancelled() => {
                // Partial file stays; nothing is recorded.
                return Err(FetchError::Cancelled);
            }
            result = session.download_payload(link, &path) => match result {
                Ok(bytes) => bytes,
                Err(error) => {
                    self.record_failed(&book.id, &identity, &error).await?;
                    return Err(FetchError::Upstream(error));
                }
            },
        };

        self.catalog
            .record_download(&NewDownload {
                book_id: &book.id,
                credential_identity: Some(&identity),
                filename: &filename,
                file_path: &path.to_string_lossy(),
                file_size: Some(bytes as i64),
                status: DownloadStatus::Completed,
                error_message: None,
            })
            .await?;

        self.pool.manager_mut().record_download(&identity);
        if let Err(error) = self.pool.manager_mut().rotate() {
            warn!(%error, "rotation after download found nothing available");
        }

        info!(bytes, path = %path.display(), "download complete");
        Ok(DownloadOutcome {
            book_id: book.id.clone(),
            filename,
            path,
            bytes,
        })
    }

    /// One page with the retry/rotate policy applied.
    async fn search_page(
        &mut self,
        query: &str,
        filters: &SearchFilters,
        page: u32,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteBook>, FetchError> {
        let attempts = self.pool.manager().len().max(1);
        let mut last_error: Option<UpstreamError> = None;

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let acquired = if attempt == 0 {
                self.pool.current().await
            } else {
                self.pool.rotate().await
            };
            let (credential, session) = match acquired {
                Ok(pair) => pair,
                Err(SessionError::Credential(error)) => return Err(error.into()),
                Err(SessionError::Login { identity, source }) => {
                    self.note_upstream_failure(&identity, &source);
                    last_error = Some(source);
                    continue;
                }
                Err(other) => return Err(other.into()),
            };
            let identity = credential.identity().to_string();

            let mut result = run_search(&session, query, filters, page, limit, cancel).await;

            // One retry on the same credential for transient failures.
            if matches!(&result, Err(FetchError::Upstream(e)) if e.is_transient()) {
                self.pause(cancel).await?;
                result = run_search(&session, query, filters, page, limit, cancel).await;
            }

            // One session refresh for auth rejections.
            if matches!(&result, Err(FetchError::Upstream(e)) if e.is_auth()) {
                if let Ok(fresh) = self.pool.refresh(&identity).await {
                    result = run_search(&fresh, query, filters, page, limit, cancel).await;
                }
            }

            match result {
                Ok(books) => {
                    self.pool.manager_mut().touch(&identity);
                    // Post-operation advance; a lone credential rotates
                    // onto itself.
                    if let Err(error) = self.pool.manager_mut().rotate() {
                        warn!(%error, "rotation after search found nothing available");
                    }
                    return Ok(books);
                }
                Err(FetchError::Upstream(error)) => {
                    if error.is_transient() {
                        // The session may be wedged; rebuild it lazily.
                        self.pool.drop_session(&identity);
                    } else if error.is_auth() || error.is_quota() {
                        self.note_upstream_failure(&identity, &error);
                    } else {
                        // Application-level error unrelated to the
                        // credential; surface it verbatim.
                        return Err(FetchError::Upstream(error));
                    }
                    last_error = Some(error);
                }
                Err(other) => return Err(other),
            }
        }

        match last_error {
            Some(error) => Err(FetchError::Upstream(error)),
            None => Err(FetchError::Credentials(
                CredentialError::AllCredentialsExhausted,
            )),
        }
    }

    /// Acquires a usable (credential, session) pair, marking credentials
    /// whose login fails and moving on, bounded by the credential count.
    async fn acquire_session(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(crate::auth::Credential, UpstreamSession), FetchError> {
        let attempts = self.pool.manager().len().max(1);
        let mut last_error: Option<UpstreamError> = None;

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let acquired = if attempt == 0 {
                self.pool.current().await
            } else {
                self.pool.rotate().await
            };
            match acquired {
                Ok(pair) => return Ok(pair),
                Err(SessionError::Credential(error)) => return Err(error.into()),
                Err(SessionError::Login { identity, source }) => {
                    self.note_upstream_failure(&identity, &source);
                    last_error = Some(source);
                }
                Err(other) => return Err(other.into()),
            }
        }

        match last_error {
            Some(error) => Err(FetchError::Upstream(error)),
            None => Err(FetchError::Credentials(
                CredentialError::AllCredentialsExhausted,
            )),
        }
    }

    /// Resolves file metadata with one session refresh on auth errors.
    async fn resolve_file(
        &mut self,
        session: &UpstreamSession,
        identity: &str,
        book_id: &str,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<crate::upstream::RemoteFile, FetchError> {
        let mut result = run_book_file(session, book_id, hash, cancel).await;

        if matches!(&result, Err(FetchError::Upstream(e)) if e.is_transient()) {
            self.pause(cancel).await?;
            result = run_book_file(session, book_id, hash, cancel).await;
        }

        if matches!(&result, Err(FetchError::Upstream(e)) if e.is_auth()) {
            if let Ok(fresh) = self.pool.refresh(identity).await {
                result = run_book_file(&fresh, book_id, hash, cancel).await;
            }
        }

        if let Err(FetchError::Upstream(error)) = &result {
            if error.is_auth() || error.is_quota() {
                self.note_upstream_failure(identity, error);
            }
        }
        result
    }

    async fn record_failed(
        &self,
        book_id: &str,
        identity: &str,
        error: &UpstreamError,
    ) -> Result<(), FetchError> {
        self.catalog
            .record_download(&NewDownload {
                book_id,
                credential_identity: Some(identity),
                filename: "",
                file_path: "",
                file_size: None,
                status: DownloadStatus::Failed,
                error_message: Some(&error.to_string()),
            })
            .await?;
        Ok(())
    }

    /// Marks a credential according to the error class.
    fn note_upstream_failure(&mut self, identity: &str, error: &UpstreamError) {
        let outcome = if error.is_quota() {
            ProbeOutcome::Exhausted
        } else if error.is_auth() {
            ProbeOutcome::Rejected {
                reason: error.to_string(),
            }
        } else {
            ProbeOutcome::Unreachable {
                reason: error.to_string(),
            }
        };
        self.pool.manager_mut().apply_outcome(identity, &outcome);
    }

    /// Jittered, cancellable delay before a retry.
    async fn pause(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        let jitter = rand::thread_rng().gen_range(0..=MAX_RETRY_JITTER_MS);
        let delay = self.config.retry_delay + Duration::from_millis(jitter);
        tokio::select! {
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

async fn run_search(
    session: &UpstreamSession,
    query: &str,
    filters: &SearchFilters,
    page: u32,
    limit: u32,
    cancel: &CancellationToken,
) -> Result<Vec<RemoteBook>, FetchError> {
    tokio::select! {
        () = cancel.cancelled() => Err(FetchError::Cancelled),
        result = session.search(query, filters, page, limit) => {
            result.map_err(FetchError::Upstream)
        }
    }
}

async fn run_book_file(
    session: &UpstreamSession,
    book_id: &str,
    hash: &str,
    cancel: &CancellationToken,
) -> Result<crate::upstream::RemoteFile, FetchError> {
    tokio::select! {
        () = cancel.cancelled() => Err(FetchError::Cancelled),
        result = session.book_file(book_id, hash) => result.map_err(FetchError::Upstream),
    }
}

fn validated_limit(filters: &SearchFilters) -> Result<u32, FetchError> {
    let limit = filters.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if !PAGE_SIZE_RANGE.contains(&limit) {
        return Err(FetchError::InvalidLimit { limit });
    }
    Ok(limit)
}

/// Serializes non-default filters for the search history.
fn filters_json(filters: &SearchFilters) -> Option<String> {
    if *filters == SearchFilters::default() {
        return None;
    }
    serde_json::to_string(filters).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_limit_defaults_and_bounds() {
        assert_eq!(
            validated_limit(&SearchFilters::default()).unwrap(),
            DEFAULT_PAGE_SIZE
        );

        let one = SearchFilters {
            limit: Some(1),
            ..SearchFilters::default()
        };
        assert_eq!(validated_limit(&one).unwrap(), 1);

        let hundred = SearchFilters {
            limit: Some(100),
            ..SearchFilters::default()
        };
        assert_eq!(validated_limit(&hundred).unwrap(), 100);

        for bad in [0, 101] {
            let filters = SearchFilters {
                limit: Some(bad),
                ..SearchFilters::default()
            };
            assert!(matches!(
                validated_limit(&filters).unwrap_err(),
                FetchError::InvalidLimit { limit } if limit == bad
            ));
        }
    }

    #[test]
    fn test_filters_json_none_for_defaults() {
        assert!(filters_json(&SearchFilters::default()).is_none());

        let filters = SearchFilters {
            language: Some("English".to_string()),
            ..SearchFilters::default()
        };
        let raw = filters_json(&filters).unwrap();
        assert!(raw.contains("English"));
    }

    #[test]
    fn test_session_error_conversion() {
        let error: FetchError = SessionError::Credential(CredentialError::NoCredentials).into();
        assert!(matches!(
            error,
            FetchError::Credentials(CredentialError::NoCredentials)
        ));
    }
}
