//! Media Fetch
//!
//! The outbound fetch layer shared by every third-party integration of a
//! media-request service: metadata providers, download-manager APIs and
//! image hosts.
//!
//! # Features
//!
//! - **Rate-limited**: FIFO queue bounding in-flight calls per provider
//! - **Cached**: read-through TTL cache with a 5-minute default
//! - **Stale-while-revalidate**: rolling reads refresh in the background
//! - **Disk image cache**: images persisted with max-age and ETag, swept on demand
//!
//! # Example
//!
//! ```no_run
//! use media_fetch::{
//!     CacheConfig, CacheRegistry, FetchConfig, LimiterRegistry, RateLimit, RemoteClient,
//!     RequestOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = FetchConfig::from_env()?;
//!     let caches = CacheRegistry::new(CacheConfig::from(&config));
//!     let limiters = LimiterRegistry::new();
//!
//!     let tmdb = RemoteClient::builder("https://api.themoviedb.org/3")
//!         .param("api_key", "...")
//!         .rate_limit("tmdb", RateLimit::per_second(20), &limiters)
//!         .cache(caches.store("tmdb"))
//!         .config(&config)
//!         .build()?;
//!
//!     let movie = tmdb.get("/movie/603", &RequestOptions::new()).await?;
//!     println!("{movie:?}");
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod image;
pub mod limiter;

pub use cache::{CacheConfig, CacheRegistry, CacheStats, CacheStore, MokaStore};
pub use client::{Payload, RemoteClient, RemoteClientBuilder, RequestOptions};
pub use config::FetchConfig;
pub use error::{FetchError, FetchResult};
pub use image::{CachedImage, ImageMeta, ImageProxy, ImageProxyBuilder, ImageStats};
pub use limiter::{LimiterRegistry, LimiterSnapshot, RateLimit, RateLimiter};
