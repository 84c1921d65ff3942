//! Disk-backed image cache.
//!
//! Images fetched from an upstream host are stored under
//! `<cache_root>/<namespace>/<key>/entry`, where `key` is a SHA-256 digest of
//! the namespace, the cache format version and the source path. Each record
//! carries its own max-age and expiry (see [`record`]). Stale records are
//! served immediately and revalidated in the background.

pub mod record;

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use regex::Regex;
use reqwest::header::{
    ACCEPT, CACHE_CONTROL, CONTENT_TYPE, ETAG, HeaderMap, HeaderName, HeaderValue,
};
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub use record::{ImageRecord, RECORD_FILE};

use crate::client::{extend_headers, http_client, join_url, send};
use crate::config::{FetchConfig, defaults};
use crate::error::FetchResult;
use crate::limiter::{LimiterRegistry, RateLimit, RateLimiter};

static MAX_AGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"max-age=(\d+)").expect("valid max-age pattern"));

/// Metadata returned alongside cached image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageMeta {
    pub cache_key: String,
    pub max_age: u64,
    /// Unix epoch milliseconds.
    pub expires_at: i64,
    pub etag: String,
    pub extension: String,
    pub is_stale: bool,
    /// True when this call fetched from upstream.
    pub cache_miss: bool,
}

/// An image and its cache metadata.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub meta: ImageMeta,
    pub bytes: Bytes,
}

impl CachedImage {
    fn new(
        cache_key: &str,
        record: ImageRecord,
        bytes: Bytes,
        now_ms: i64,
        cache_miss: bool,
    ) -> Self {
        let meta = ImageMeta {
            cache_key: cache_key.to_string(),
            max_age: record.max_age,
            expires_at: record.expires_at,
            is_stale: record.is_expired_at(now_ms),
            etag: record.etag,
            extension: record.extension,
            cache_miss,
        };
        Self { meta, bytes }
    }
}

/// Disk usage of one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImageStats {
    /// Total bytes on disk.
    pub size: u64,
    /// Number of image records.
    pub image_count: usize,
}

/// Builder for [`ImageProxy`].
#[derive(Debug)]
pub struct ImageProxyBuilder {
    namespace: String,
    base_url: String,
    cache_root: Option<PathBuf>,
    headers: Vec<(String, String)>,
    limiter: Option<RateLimiter>,
    config: FetchConfig,
}

impl ImageProxyBuilder {
    /// Override the cache root from the config.
    #[must_use]
    pub fn cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Share the limiter registered under `id`.
    #[must_use]
    pub fn rate_limit(mut self, id: &str, limit: RateLimit, registry: &LimiterRegistry) -> Self {
        self.limiter = Some(registry.limiter(id, limit));
        self
    }

    #[must_use]
    pub fn limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn config(mut self, config: &FetchConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Build the proxy.
    ///
    /// # Errors
    ///
    /// Returns error if a header does not parse or the HTTP client cannot be
    /// initialised.
    pub fn build(self) -> FetchResult<ImageProxy> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("image/*,*/*;q=0.8"));
        extend_headers(&mut headers, &self.headers)?;

        Ok(ImageProxy {
            http: http_client(headers, &self.config)?,
            root: self.cache_root.unwrap_or_else(|| self.config.image_cache_dir.clone()),
            namespace: self.namespace,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            limiter: self.limiter,
            default_max_age: self.config.image_max_age,
        })
    }
}

/// Caches images from one upstream host under one namespace.
#[derive(Clone)]
pub struct ImageProxy {
    http: ClientWithMiddleware,
    root: PathBuf,
    namespace: String,
    base_url: String,
    limiter: Option<RateLimiter>,
    default_max_age: u64,
}

impl ImageProxy {
    #[must_use]
    pub fn builder(namespace: impl Into<String>, base_url: impl Into<String>) -> ImageProxyBuilder {
        ImageProxyBuilder {
            namespace: namespace.into(),
            base_url: base_url.into(),
            cache_root: None,
            headers: Vec::new(),
            limiter: None,
            config: FetchConfig::default(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn cache_root(&self) -> &Path {
        &self.root
    }

    /// Filesystem-safe key for `path`.
    #[must_use]
    pub fn cache_key(&self, path: &str) -> String {
        image_key(&self.namespace, path)
    }

    /// Directory holding the record for `path`.
    #[must_use]
    pub fn key_dir(&self, path: &str) -> PathBuf {
        self.root.join(&self.namespace).join(self.cache_key(path))
    }

    /// Serve `path` from disk, fetching it on a miss.
    ///
    /// A stale record is returned as is and refreshed in the background. If
    /// the fetch for a missing record fails and `fallback` is given, the
    /// fallback path is tried once instead.
    pub async fn get_image(&self, path: &str, fallback: Option<&str>) -> FetchResult<CachedImage> {
        match self.load(path).await {
            Ok(image) => Ok(image),
            Err(e) => match fallback {
                Some(fallback) => {
                    tracing::debug!(
                        namespace = %self.namespace,
                        path,
                        fallback,
                        error = %e,
                        "Using fallback image"
                    );
                    self.load(fallback).await
                }
                None => Err(e),
            },
        }
    }

    async fn load(&self, path: &str) -> FetchResult<CachedImage> {
        let key = self.cache_key(path);

        if let Some(image) = self.read(&key).await {
            if image.meta.is_stale {
                tracing::debug!(
                    namespace = %self.namespace,
                    path,
                    cache_key = %key,
                    "Stale image, revalidating"
                );
                self.spawn_revalidate(path.to_string(), key);
            }
            return Ok(image);
        }

        self.set(path, &key).await
    }

    /// Fetch `path` and replace the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::FetchError::HttpStatus`] for a non-2xx response, or the
    /// transport or filesystem error that stopped the write.
    pub async fn set(&self, path: &str, key: &str) -> FetchResult<CachedImage> {
        let url = join_url(&self.base_url, path);
        tracing::debug!(namespace = %self.namespace, %url, "Fetching image");

        let response = send(self.limiter.as_ref(), self.http.get(url.as_str())).await?;
        let record = self.record_for(response.headers(), now_millis());
        let bytes = response.bytes().await?;

        let dir = self.root.join(&self.namespace).join(key);
        record.write(&dir, &bytes).await?;

        Ok(CachedImage::new(key, record, bytes, now_millis(), true))
    }

    /// The stored record for `path`, without revalidation.
    pub async fn cached(&self, path: &str) -> Option<CachedImage> {
        self.read(&self.cache_key(path)).await
    }

    /// Remove the record for `path`. Returns false if nothing was cached.
    ///
    /// # Errors
    ///
    /// Returns error if the key directory exists but cannot be removed.
    pub async fn clear_cached_image(&self, path: &str) -> FetchResult<bool> {
        match tokio::fs::remove_dir_all(self.key_dir(path)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every expired or unreadable record under `namespace`.
    ///
    /// A key directory without a record is removed only when it holds no
    /// temp file younger than [`defaults::PENDING_WRITE_GRACE`], so a first
    /// write in progress is left alone. Returns the number of key directories
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns error if the namespace directory cannot be listed or a key
    /// directory cannot be removed.
    pub async fn clear_cache(cache_root: &Path, namespace: &str) -> FetchResult<usize> {
        let ns_dir = cache_root.join(namespace);
        let mut entries = match tokio::fs::read_dir(&ns_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = now_millis();
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir = entry.path();

            let expired = match ImageRecord::read_header(&dir.join(RECORD_FILE)).await {
                Ok(Some(record)) => record.is_expired_at(now),
                Ok(None) => {
                    !record::has_pending_write(&dir, defaults::PENDING_WRITE_GRACE).await?
                }
                Err(e) => {
                    tracing::debug!(path = %dir.display(), error = %e, "Unreadable image record");
                    true
                }
            };

            if expired {
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        tracing::info!(namespace, removed, "Swept image cache");
        Ok(removed)
    }

    /// Total size and record count under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns error if a directory cannot be listed.
    pub async fn image_stats(cache_root: &Path, namespace: &str) -> FetchResult<ImageStats> {
        let mut stats = ImageStats::default();
        let mut pending = vec![cache_root.join(namespace)];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else {
                    stats.size += metadata.len();
                    if entry.file_name() == RECORD_FILE {
                        stats.image_count += 1;
                    }
                }
            }
        }

        Ok(stats)
    }

    async fn read(&self, key: &str) -> Option<CachedImage> {
        let path = self.root.join(&self.namespace).join(key).join(RECORD_FILE);

        match ImageRecord::read(&path).await {
            Ok(Some((record, bytes))) => {
                Some(CachedImage::new(key, record, bytes, now_millis(), false))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    namespace = %self.namespace,
                    cache_key = key,
                    error = %e,
                    "Unreadable image record, treating as miss"
                );
                None
            }
        }
    }

    fn spawn_revalidate(&self, path: String, key: String) {
        let proxy = self.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy.set(&path, &key).await {
                tracing::warn!(
                    namespace = %proxy.namespace,
                    %path,
                    error = %e,
                    "Image revalidation failed"
                );
            }
        });
    }

    fn record_for(&self, headers: &HeaderMap, now_ms: i64) -> ImageRecord {
        let max_age = header_str(headers, CACHE_CONTROL)
            .and_then(parse_max_age)
            .filter(|age| *age > 0)
            .unwrap_or(self.default_max_age);
        let max_age_ms = i64::try_from(max_age.saturating_mul(1000)).unwrap_or(i64::MAX);

        ImageRecord {
            max_age,
            expires_at: now_ms.saturating_add(max_age_ms),
            etag: header_str(headers, ETAG).map(strip_etag).unwrap_or_default(),
            extension: extension_for(header_str(headers, CONTENT_TYPE)),
        }
    }
}

impl std::fmt::Debug for ImageProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageProxy")
            .field("namespace", &self.namespace)
            .field("base_url", &self.base_url)
            .field("root", &self.root)
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

/// SHA-256 of namespace, format version and path, base64url without padding.
pub(crate) fn image_key(namespace: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{namespace}:{}:{path}", defaults::IMAGE_CACHE_VERSION).as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_max_age(cache_control: &str) -> Option<u64> {
    MAX_AGE.captures(cache_control)?.get(1)?.as_str().parse().ok()
}

fn strip_etag(etag: &str) -> String {
    etag.trim().trim_start_matches("W/").trim_matches('"').to_string()
}

/// File extension for a content type, `bin` when unknown.
fn extension_for(content_type: Option<&str>) -> String {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let subtype = match mime.split_once('/') {
        Some((_, subtype)) if !subtype.is_empty() => subtype,
        _ => return "bin".to_string(),
    };

    match subtype {
        "svg+xml" => "svg".to_string(),
        "x-icon" | "vnd.microsoft.icon" => "ico".to_string(),
        "jpeg" | "pjpeg" => "jpg".to_string(),
        other => other.split('+').next().unwrap_or(other).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_key_is_filesystem_safe() {
        let key = image_key("tmdb", "/t/p/w500/abc.jpg");
        assert_eq!(key.len(), 43);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(key, image_key("tmdb", "/t/p/w500/abc.jpg"));
        assert_ne!(key, image_key("tvdb", "/t/p/w500/abc.jpg"));
    }

    #[test]
    fn test_parse_max_age() {
        assert_eq!(parse_max_age("public, max-age=31536000"), Some(31_536_000));
        assert_eq!(parse_max_age("no-cache"), None);
    }

    #[test]
    fn test_strip_etag() {
        assert_eq!(strip_etag("\"abc.123\""), "abc.123");
        assert_eq!(strip_etag("W/\"weak\""), "weak");
        assert_eq!(strip_etag("bare"), "bare");
    }

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for(Some("image/png")), "png");
        assert_eq!(extension_for(Some("image/jpeg; charset=binary")), "jpg");
        assert_eq!(extension_for(Some("image/svg+xml")), "svg");
        assert_eq!(extension_for(Some("image/x-icon")), "ico");
        assert_eq!(extension_for(Some("garbage")), "bin");
        assert_eq!(extension_for(None), "bin");
    }

    #[test]
    fn test_record_for_defaults_zero_max_age() {
        let proxy = ImageProxy::builder("tmdb", "http://img.test").build().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
        headers.insert(ETAG, HeaderValue::from_static("\"v1\""));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/webp"));

        let record = proxy.record_for(&headers, 1_000);
        assert_eq!(record.max_age, defaults::IMAGE_MAX_AGE);
        assert_eq!(record.expires_at, 1_000 + 86_400_000);
        assert_eq!(record.etag, "v1");
        assert_eq!(record.extension, "webp");
    }
}
