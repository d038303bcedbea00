//! Error types for the upstream service client.
//!
//! Errors carry enough context to drive the retry/rotate policy: the
//! classification helpers sort failures into transient (retry, then
//! rotate), auth (refresh session, mark invalid), and quota (mark
//! exhausted) categories.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from talking to the upstream service.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Network-level error (DNS, connection refused, TLS, etc.)
    #[error("network error calling {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout calling {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response outside the JSON envelope.
    #[error("HTTP {status} calling {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The service rejected the session or credentials.
    #[error("upstream rejected authentication: {message}")]
    Auth {
        /// Upstream explanation; never contains secrets.
        message: String,
    },

    /// The account's daily download quota is used up.
    #[error("upstream download quota exhausted")]
    Quota,

    /// Application-level failure reported inside the JSON envelope.
    #[error("upstream error: {message}")]
    Api {
        /// Upstream explanation.
        message: String,
    },

    /// The response body did not match the expected shape.
    #[error("invalid upstream response: {message}")]
    InvalidResponse {
        /// What was malformed.
        message: String,
    },

    /// File system error while writing a payload.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl UpstreamError {
    /// Creates a network error from a reqwest error, folding timeouts into
    /// their own variant.
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an authentication rejection error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Creates an application-level error, recognizing quota wording.
    ///
    /// The upstream reports quota exhaustion as a plain envelope error;
    /// messages mentioning the daily limit are promoted to [`Self::Quota`].
    pub fn api(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if lowered.contains("limit") || lowered.contains("quota") {
            Self::Quota
        } else {
            Self::Api { message }
        }
    }

    /// Creates an invalid-response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying (possibly on another credential) may help.
    ///
    /// Transient covers transport failures, timeouts, and server-side
    /// status codes (5xx, 408, 429).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => {
                matches!(*status, 408 | 429) || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// Whether the failure indicates rejected authentication.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Auth { .. } => true,
            Self::HttpStatus { status, .. } => matches!(*status, 401 | 403),
            _ => false,
        }
    }

    /// Whether the failure indicates an exhausted download quota.
    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_5xx_is_transient() {
        for status in [500, 502, 503, 504] {
            assert!(UpstreamError::http_status("http://x", status).is_transient());
        }
    }

    #[test]
    fn test_http_retryable_4xx_is_transient() {
        assert!(UpstreamError::http_status("http://x", 408).is_transient());
        assert!(UpstreamError::http_status("http://x", 429).is_transient());
        assert!(!UpstreamError::http_status("http://x", 404).is_transient());
    }

    #[test]
    fn test_http_auth_statuses_are_auth() {
        assert!(UpstreamError::http_status("http://x", 401).is_auth());
        assert!(UpstreamError::http_status("http://x", 403).is_auth());
        assert!(!UpstreamError::http_status("http://x", 500).is_auth());
    }

    #[test]
    fn test_auth_variant_is_auth_not_transient() {
        let error = UpstreamError::auth("wrong password");
        assert!(error.is_auth());
        assert!(!error.is_transient());
    }

    #[test]
    fn test_api_promotes_quota_wording() {
        assert!(UpstreamError::api("daily limit reached").is_quota());
        assert!(UpstreamError::api("Download quota exceeded").is_quota());
        assert!(!UpstreamError::api("book not found").is_quota());
    }

    #[test]
    fn test_quota_is_not_transient_or_auth() {
        let error = UpstreamError::Quota;
        assert!(error.is_quota());
        assert!(!error.is_transient());
        assert!(!error.is_auth());
    }

    #[test]
    fn test_display_messages_name_the_url() {
        let error = UpstreamError::Timeout {
            url: "https://example.com/eapi".to_string(),
        };
        assert!(error.to_string().contains("https://example.com/eapi"));
    }
}
