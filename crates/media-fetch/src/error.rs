//! Error types for the fetch layer.
//!
//! Uses `thiserror` for structured error handling with automatic `From` implementations.

use reqwest::header::HeaderMap;

/// Errors from the outbound fetch layer.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// Upstream answered with a non-2xx status.
    ///
    /// The response headers are kept so callers can inspect `Retry-After`
    /// and similar before deciding whether to retry.
    #[error("HTTP {status} {status_text} from {url}: {body}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Canonical reason phrase
        status_text: String,
        /// Response body text
        body: String,
        /// Request URL
        url: String,
        /// Response headers
        headers: HeaderMap,
    },

    /// A cache store could not be reached.
    #[error("Cache store '{store}' unavailable: {message}")]
    CacheUnavailable {
        /// Store name
        store: String,
        /// Failure detail
        message: String,
    },

    /// The fetch did not complete (task panicked, fetch aborted).
    #[error("Fetch failed: {message}")]
    FetchFailed {
        /// Failure detail
        message: String,
    },

    /// HTTP transport error (connection, DNS, TLS, etc.)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Middleware error
    #[error("Middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// JSON parsing error
    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Base URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Header name or value rejected
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Image cache record is truncated or has an unreadable header
    #[error("Corrupt cache record: {0}")]
    Record(String),
}

impl FetchError {
    /// Create an HTTP status error.
    #[must_use]
    pub fn http_status(
        status: reqwest::StatusCode,
        body: impl Into<String>,
        url: impl Into<String>,
        headers: HeaderMap,
    ) -> Self {
        Self::HttpStatus {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body: body.into(),
            url: url.into(),
            headers,
        }
    }

    /// Create a cache unavailable error.
    #[must_use]
    pub fn cache_unavailable(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CacheUnavailable { store: store.into(), message: message.into() }
    }

    /// Create a fetch failed error.
    #[must_use]
    pub fn fetch_failed(message: impl Into<String>) -> Self {
        Self::FetchFailed { message: message.into() }
    }

    /// Create a corrupt record error.
    #[must_use]
    pub fn record(message: impl Into<String>) -> Self {
        Self::Record(message.into())
    }

    /// Upstream status code, if this error came from a non-2xx response.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true for an upstream 404.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.status(), Some(404))
    }

    /// Returns true if retrying the same request may succeed.
    ///
    /// Callers own the retry policy; this only classifies.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status == 429 || (500..=599).contains(status),
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Middleware(_) | Self::FetchFailed { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias for fetch operations.
pub type FetchResult<T> = Result<T, FetchError>;
