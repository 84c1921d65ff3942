//! Configuration for the fetch layer.

use std::path::PathBuf;
use std::time::Duration;

/// Default values shared by every client and image proxy.
pub mod defaults {
    use std::time::Duration;

    /// Request timeout.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Connection timeout.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// TTL applied when a call does not specify one (5 minutes).
    pub const CACHE_TTL: Duration = Duration::from_secs(300);

    /// Longest TTL a cache entry is kept for; larger values are clamped.
    pub const MAX_CACHE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    /// Rolling reads refresh once an entry is older than this.
    pub const ROLLING_BUFFER: Duration = Duration::from_secs(10);

    /// Maximum entries per named cache store.
    pub const CACHE_MAX_SIZE: u64 = 10_000;

    /// Image max-age when upstream sends none (or zero).
    pub const IMAGE_MAX_AGE: u64 = 86_400;

    /// Bumping this orphans every existing image record.
    pub const IMAGE_CACHE_VERSION: u32 = 1;

    /// Sweeps leave key directories holding a temp file younger than this.
    pub const PENDING_WRITE_GRACE: Duration = Duration::from_secs(60);

    /// Root directory for the disk image cache.
    pub const IMAGE_CACHE_DIR: &str = "cache/images";

    /// Maximum idle connections kept per host.
    pub const MAX_KEEPALIVE: usize = 10;

    /// Keepalive expiry.
    pub const KEEPALIVE_EXPIRY: Duration = Duration::from_secs(30);

    /// Transient retries; zero leaves retry policy to callers.
    pub const MAX_RETRIES: u32 = 0;
}

/// Fetch layer configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Request timeout.
    pub request_timeout: Duration,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// TTL used when a call passes none.
    pub default_ttl: Duration,

    /// Rolling refresh buffer.
    pub rolling_buffer: Duration,

    /// Maximum entries per cache store.
    pub cache_max_size: u64,

    /// Fallback image max-age in seconds.
    pub image_max_age: u64,

    /// Disk image cache root.
    pub image_cache_dir: PathBuf,

    /// Transient retries installed as middleware (0 = none).
    pub max_retries: u32,
}

impl FetchConfig {
    /// Create a configuration with library defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            request_timeout: defaults::REQUEST_TIMEOUT,
            connect_timeout: defaults::CONNECT_TIMEOUT,
            default_ttl: defaults::CACHE_TTL,
            rolling_buffer: defaults::ROLLING_BUFFER,
            cache_max_size: defaults::CACHE_MAX_SIZE,
            image_max_age: defaults::IMAGE_MAX_AGE,
            image_cache_dir: PathBuf::from(defaults::IMAGE_CACHE_DIR),
            max_retries: defaults::MAX_RETRIES,
        }
    }

    /// Create a test configuration rooted at a scratch directory.
    #[must_use]
    pub fn for_testing(image_cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            image_cache_dir: image_cache_dir.into(),
            ..Self::new()
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Reads `MEDIA_FETCH_CACHE_DIR`, `MEDIA_FETCH_DEFAULT_TTL` (seconds) and
    /// `MEDIA_FETCH_MAX_RETRIES`. Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a numeric variable does not parse.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::new();

        if let Ok(dir) = std::env::var("MEDIA_FETCH_CACHE_DIR") {
            config.image_cache_dir = PathBuf::from(dir);
        }
        if let Ok(ttl) = std::env::var("MEDIA_FETCH_DEFAULT_TTL") {
            config.default_ttl = Duration::from_secs(ttl.parse()?);
        }
        if let Ok(retries) = std::env::var("MEDIA_FETCH_MAX_RETRIES") {
            config.max_retries = retries.parse()?;
        }

        Ok(config)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::new()
    }
}
