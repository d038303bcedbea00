//! HTTP client for the upstream book service.
//!
//! The service exposes a JSON `eapi` surface authenticated by session
//! cookies. Password credentials log in once and receive token cookies;
//! token credentials present their cookies directly and are verified with
//! a profile fetch. All responses share an envelope with a `success` flag
//! and an optional `error` message.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::COOKIE;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};
use url::Url;

use super::error::UpstreamError;
use crate::auth::{Credential, CredentialAuth, CredentialProbe, ProbeOutcome};

/// Default upstream endpoint.
pub const DEFAULT_BASE_URL: &str = "https://1lib.sk";

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Browser-like User-Agent; the service rejects obviously scripted agents.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/110.0.0.0 Safari/537.36";

/// Language cookie sent with every request.
const LANGUAGE_COOKIE: &str = "siteLanguageV2=en";

/// Result ordering accepted by the search endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Most popular first.
    Popular,
    /// Newest publication year first.
    Year,
    /// Alphabetical by title.
    Title,
}

impl SortOrder {
    /// Returns the wire string sent to the search endpoint.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Popular => "popular",
            Self::Year => "year",
            Self::Title => "title",
        }
    }
}

/// Optional search filters forwarded to the upstream service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Earliest publication year.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_from: Option<i32>,
    /// Latest publication year.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_to: Option<i32>,
    /// Language name filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// File extension filter (e.g. `pdf`, `epub`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// Result ordering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,
    /// Page to fetch; the fetch engine defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Page size, 1 to 100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// A book record as returned by the upstream search endpoint.
///
/// Ids and years arrive as either JSON strings or numbers depending on
/// the endpoint; both forms normalize to strings. Unknown fields are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteBook {
    /// Stable external book id.
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub id: String,
    /// Content hash used to address the file.
    #[serde(default)]
    pub hash: String,
    /// Book title.
    #[serde(default)]
    pub title: String,
    /// Raw author string; multiple names are separated by punctuation.
    #[serde(default)]
    pub author: Option<String>,
    /// Publication year.
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
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
    /// Human-readable file size, e.g. "10.5 MB".
    #[serde(default)]
    pub size: Option<String>,
    /// File size in bytes.
    #[serde(default)]
    pub filesize: Option<i64>,
    /// Cover image URL.
    #[serde(default)]
    pub cover: Option<String>,
    /// Book description.
    #[serde(default)]
    pub description: Option<String>,
    /// ISBN.
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
    pub isbn: Option<String>,
    /// Edition.
    #[serde(default, deserialize_with = "de_opt_string_or_number")]
    pub edition: Option<String>,
    /// Page count.
    #[serde(default)]
    pub pages: Option<i64>,
}

/// File metadata returned before downloading a payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteFile {
    /// Preferred display name for the file.
    #[serde(default)]
    pub description: Option<String>,
    /// Book title fallback.
    #[serde(default)]
    pub title: Option<String>,
    /// Author shown in the filename.
    #[serde(default)]
    pub author: Option<String>,
    /// File extension.
    #[serde(default)]
    pub extension: Option<String>,
    /// Direct payload link.
    #[serde(rename = "downloadLink", default)]
    pub download_link: Option<String>,
}

/// Account profile slice used for quota accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    /// Daily download allowance.
    pub downloads_limit: i64,
    /// Downloads already used today.
    pub downloads_today: i64,
}

impl Profile {
    /// Remaining downloads for today, never negative.
    #[must_use]
    pub fn downloads_left(&self) -> i64 {
        (self.downloads_limit - self.downloads_today).max(0)
    }
}

/// Connection settings for the upstream client.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Service base URL.
    pub base_url: Url,
    /// Per-call timeout; treated as a network error on expiry.
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Unauthenticated client; produces [`UpstreamSession`]s via login.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: Url,
}

impl UpstreamClient {
    /// Creates a client from connection settings.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration; this does not happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(config: UpstreamConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self {
            http,
            base_url: config.base_url,
        }
    }

    /// Authenticates a credential and returns a live session.
    ///
    /// Password credentials post to the login endpoint and adopt the token
    /// cookies from the response; token credentials are verified with a
    /// profile fetch.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Auth`] when the service rejects the credential,
    /// transport errors otherwise.
    #[instrument(skip(self, credential), fields(identity = credential.identity()))]
    pub async fn login(&self, credential: &Credential) -> Result<UpstreamSession, UpstreamError> {
        match &credential.auth {
            CredentialAuth::Password { email, password } => {
                let url = self.endpoint("/eapi/user/login")?;
                let form = vec![
                    ("email".to_string(), email.clone()),
                    ("password".to_string(), password.clone()),
                ];
                let envelope =
                    post_form(&self.http, url, &form, LANGUAGE_COOKIE.to_string()).await?;
                if !envelope_success(&envelope) {
                    return Err(UpstreamError::auth(envelope_error(&envelope)));
                }

                let user = envelope.get("user").cloned().unwrap_or(Value::Null);
                let user_id = stringify(user.get("id")).ok_or_else(|| {
                    UpstreamError::invalid_response("login response missing user.id")
                })?;
                let user_key = stringify(user.get("remix_userkey")).ok_or_else(|| {
                    UpstreamError::invalid_response("login response missing user.remix_userkey")
                })?;

                debug!("password login succeeded");
                Ok(self.session(user_id, user_key))
            }
            CredentialAuth::Token { user_id, user_key } => {
                let session = self.session(user_id.clone(), user_key.clone());
                // A profile fetch both verifies the token pair and warms
                // the session.
                session.profile().await?;
                debug!("token login verified");
                Ok(session)
            }
        }
    }

    fn session(&self, user_id: String, user_key: String) -> UpstreamSession {
        UpstreamSession {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            user_id,
            user_key,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, UpstreamError> {
        self.base_url
            .join(path)
            .map_err(|e| UpstreamError::invalid_response(format!("bad endpoint {path}: {e}")))
    }
}

#[async_trait]
impl CredentialProbe for UpstreamClient {
    async fn probe(&self, credential: &Credential) -> ProbeOutcome {
        let session = match self.login(credential).await {
            Ok(session) => session,
            Err(error) => return outcome_from_error(&error),
        };
        match session.profile().await {
            Ok(profile) => {
                let left = profile.downloads_left();
                if left <= 0 {
                    ProbeOutcome::Exhausted
                } else {
                    ProbeOutcome::Valid {
                        downloads_left: Some(left),
                    }
                }
            }
            Err(error) => outcome_from_error(&error),
        }
    }
}

/// Maps an upstream error to a probe outcome per the validation table.
fn outcome_from_error(error: &UpstreamError) -> ProbeOutcome {
    if error.is_quota() {
        ProbeOutcome::Exhausted
    } else if error.is_auth() {
        ProbeOutcome::Rejected {
            reason: error.to_string(),
        }
    } else {
        ProbeOutcome::Unreachable {
            reason: error.to_string(),
        }
    }
}

/// Authenticated session bound to one credential's token cookies.
#[derive(Debug, Clone)]
pub struct UpstreamSession {
    http: reqwest::Client,
    base_url: Url,
    user_id: String,
    user_key: String,
}

impl UpstreamSession {
    fn cookie_header(&self) -> String {
        format!(
            "{LANGUAGE_COOKIE}; remix_userid={}; remix_userkey={}",
            self.user_id, self.user_key
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, UpstreamError> {
        self.base_url
            .join(path)
            .map_err(|e| UpstreamError::invalid_response(format!("bad endpoint {path}: {e}")))
    }

    /// Fetches the account profile; the lightweight validation probe.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Auth`] when the session is rejected, transport
    /// errors otherwise.
    #[instrument(skip(self))]
    pub async fn profile(&self) -> Result<Profile, UpstreamError> {
        let url = self.endpoint("/eapi/user/profile")?;
        let envelope = get_json(&self.http, url, self.cookie_header()).await?;
        if !envelope_success(&envelope) {
            return Err(UpstreamError::auth(envelope_error(&envelope)));
        }

        let user = envelope.get("user").cloned().unwrap_or(Value::Null);
        Ok(Profile {
            downloads_limit: user
                .get("downloads_limit")
                .and_then(Value::as_i64)
                .unwrap_or(10),
            downloads_today: user
                .get("downloads_today")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        })
    }

    /// Searches the service for books.
    ///
    /// Individual result records that fail to parse are skipped; the
    /// upstream occasionally interleaves adverts into the result array.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Api`]/[`UpstreamError::Quota`] on envelope errors,
    /// transport errors otherwise.
    #[instrument(skip(self, filters), fields(query = %query, page))]
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        page: u32,
        limit: u32,
    ) -> Result<Vec<RemoteBook>, UpstreamError> {
        let url = self.endpoint("/eapi/book/search")?;

        let mut form = vec![
            ("message".to_string(), query.to_string()),
            ("page".to_string(), page.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(year_from) = filters.year_from {
            form.push(("yearFrom".to_string(), year_from.to_string()));
        }
        if let Some(year_to) = filters.year_to {
            form.push(("yearTo".to_string(), year_to.to_string()));
        }
        if let Some(language) = &filters.language {
            form.push(("languages".to_string(), language.clone()));
        }
        if let Some(extension) = &filters.extension {
            form.push(("extensions[]".to_string(), extension.clone()));
        }
        if let Some(order) = filters.order {
            form.push(("order".to_string(), order.as_str().to_string()));
        }

        let envelope = post_form(&self.http, url, &form, self.cookie_header()).await?;
        if !envelope_success(&envelope) {
            return Err(UpstreamError::api(envelope_error(&envelope)));
        }

        let raw_books = envelope
            .get("books")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut books = Vec::with_capacity(raw_books.len());
        for raw in raw_books {
            match serde_json::from_value::<RemoteBook>(raw) {
                Ok(book) => books.push(book),
                Err(error) => debug!(%error, "skipping unparseable search result"),
            }
        }
        Ok(books)
    }

    /// Resolves the downloadable file for a book.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Quota`] when the daily limit blocks the download,
    /// [`UpstreamError::Api`] when no link is offered, transport errors
    /// otherwise.
    #[instrument(skip(self))]
    pub async fn book_file(&self, book_id: &str, hash: &str) -> Result<RemoteFile, UpstreamError> {
        let url = self.endpoint(&format!("/eapi/book/{book_id}/{hash}/file"))?;
        let envelope = get_json(&self.http, url, self.cookie_header()).await?;
        if !envelope_success(&envelope) {
            return Err(UpstreamError::api(envelope_error(&envelope)));
        }

        let file_value = envelope.get("file").cloned().unwrap_or(Value::Null);
        let file: RemoteFile = serde_json::from_value(file_value)
            .map_err(|e| UpstreamError::invalid_response(format!("malformed file object: {e}")))?;

        if file.download_link.is_none() {
            return Err(UpstreamError::api(format!(
                "no download link offered for book {book_id}"
            )));
        }
        Ok(file)
    }

    /// Streams a payload link to `dest`, returning the bytes written.
    ///
    /// # Errors
    ///
    /// Transport errors from the fetch, [`UpstreamError::HttpStatus`] on a
    /// non-success status, [`UpstreamError::Io`] on write failure.
    #[instrument(skip(self), fields(dest = %dest.display()))]
    pub async fn download_payload(&self, link: &str, dest: &Path) -> Result<u64, UpstreamError> {
        let url = match Url::parse(link) {
            Ok(url) => url,
            // Some mirrors hand back host-relative links.
            Err(_) => self.endpoint(link)?,
        };

        let response = self
            .http
            .get(url.clone())
            .header(COOKIE, self.cookie_header())
            .send()
            .await
            .map_err(|e| UpstreamError::transport(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::http_status(url.as_str(), status.as_u16()));
        }

        let file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| UpstreamError::io(dest, e))?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut total: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpstreamError::transport(url.as_str(), e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| UpstreamError::io(dest, e))?;
            total += chunk.len() as u64;
        }
        writer.flush().await.map_err(|e| UpstreamError::io(dest, e))?;

        debug!(bytes = total, "payload written");
        Ok(total)
    }
}

async fn post_form(
    http: &reqwest::Client,
    url: Url,
    form: &[(String, String)],
    cookie: String,
) -> Result<Value, UpstreamError> {
    let response = http
        .post(url.clone())
        .header(COOKIE, cookie)
        .form(form)
        .send()
        .await
        .map_err(|e| UpstreamError::transport(url.as_str(), e))?;
    read_envelope(url, response).await
}

async fn get_json(
    http: &reqwest::Client,
    url: Url,
    cookie: String,
) -> Result<Value, UpstreamError> {
    let response = http
        .get(url.clone())
        .header(COOKIE, cookie)
        .send()
        .await
        .map_err(|e| UpstreamError::transport(url.as_str(), e))?;
    read_envelope(url, response).await
}

async fn read_envelope(url: Url, response: reqwest::Response) -> Result<Value, UpstreamError> {
    let status = response.status();
    if !status.is_success() {
        return Err(UpstreamError::http_status(url.as_str(), status.as_u16()));
    }

    response.json::<Value>().await.map_err(|e| {
        if e.is_decode() {
            UpstreamError::invalid_response(format!("malformed JSON from {url}: {e}"))
        } else {
            UpstreamError::transport(url.as_str(), e)
        }
    })
}

/// The envelope `success` flag arrives as a bool or a 0/1 number.
fn envelope_success(envelope: &Value) -> bool {
    match envelope.get("success") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

fn envelope_error(envelope: &Value) -> String {
    match envelope.get("error") {
        Some(Value::String(message)) => message.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => "unknown upstream error".to_string(),
    }
}

fn stringify(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn de_opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
