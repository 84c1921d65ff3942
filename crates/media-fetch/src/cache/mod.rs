//! TTL cache stores for decoded responses.
//!
//! [`CacheStore`] is the minimal contract the client needs. [`MokaStore`] is
//! the in-process implementation, and [`CacheRegistry`] hands out named
//! stores so that clients for the same provider share entries.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;

use crate::client::Payload;
use crate::config::{FetchConfig, defaults};
use crate::error::FetchResult;

/// TTL-capable key/value store.
///
/// Errors are reported as [`crate::FetchError::CacheUnavailable`]; callers
/// treat them as a miss.
#[async_trait]
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    /// Store name, for logs and stats.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> FetchResult<Option<Payload>>;

    async fn set(&self, key: &str, value: Payload, ttl: Duration) -> FetchResult<()>;

    async fn delete(&self, key: &str) -> FetchResult<()>;

    /// Time left before `key` expires, or `None` if absent.
    async fn remaining_ttl(&self, key: &str) -> FetchResult<Option<Duration>>;

    /// Live entry count.
    async fn entry_count(&self) -> u64;

    /// Drop every entry.
    async fn flush(&self);
}

#[derive(Debug, Clone)]
struct Entry {
    payload: Payload,
    expires_at: Instant,
}

/// Each entry lives until its own `expires_at`.
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

/// In-process store backed by a moka cache with per-entry expiry.
#[derive(Clone)]
pub struct MokaStore {
    name: String,
    cache: Cache<String, Entry>,
}

impl MokaStore {
    #[must_use]
    pub fn new(name: impl Into<String>, max_capacity: u64) -> Self {
        let cache = Cache::builder().max_capacity(max_capacity).expire_after(PerEntryTtl).build();
        Self { name: name.into(), cache }
    }
}

#[async_trait]
impl CacheStore for MokaStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> FetchResult<Option<Payload>> {
        Ok(self.cache.get(key).await.map(|entry| entry.payload))
    }

    /// TTLs above [`defaults::MAX_CACHE_TTL`] are clamped to it.
    async fn set(&self, key: &str, value: Payload, ttl: Duration) -> FetchResult<()> {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl.min(defaults::MAX_CACHE_TTL)).unwrap_or(now);
        let entry = Entry { payload: value, expires_at };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> FetchResult<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> FetchResult<Option<Duration>> {
        Ok(self
            .cache
            .get(key)
            .await
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now())))
    }

    async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    async fn flush(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }
}

impl std::fmt::Debug for MokaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaStore").field("name", &self.name).finish()
    }
}

/// Registry settings.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum entries per store.
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_capacity: defaults::CACHE_MAX_SIZE }
    }
}

impl From<&FetchConfig> for CacheConfig {
    fn from(config: &FetchConfig) -> Self {
        Self { max_capacity: config.cache_max_size }
    }
}

/// Entry count for one named store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub name: String,
    pub entries: u64,
}

/// Named cache stores, passed explicitly to every client that needs one.
#[derive(Debug, Clone, Default)]
pub struct CacheRegistry {
    config: CacheConfig,
    stores: Arc<Mutex<BTreeMap<String, Arc<dyn CacheStore>>>>,
}

impl CacheRegistry {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self { config, stores: Arc::default() }
    }

    /// The store called `name`, created as a [`MokaStore`] on first use.
    pub fn store(&self, name: &str) -> Arc<dyn CacheStore> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(stores.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(store = name, "Creating cache store");
            Arc::new(MokaStore::new(name, self.config.max_capacity))
        }))
    }

    /// Register a custom store under `name`, replacing any existing one.
    pub fn register(&self, name: &str, store: Arc<dyn CacheStore>) {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        stores.insert(name.to_string(), store);
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn CacheStore>)> {
        let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        stores.iter().map(|(name, store)| (name.clone(), Arc::clone(store))).collect()
    }

    /// Entry counts per store, sorted by name.
    pub async fn stats(&self) -> Vec<CacheStats> {
        let mut stats = Vec::new();
        for (name, store) in self.snapshot() {
            stats.push(CacheStats { name, entries: store.entry_count().await });
        }
        stats
    }

    /// Empty one store. Returns false if no store has that name.
    pub async fn flush(&self, name: &str) -> bool {
        let store = {
            let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
            stores.get(name).cloned()
        };

        match store {
            Some(store) => {
                store.flush().await;
                tracing::info!(store = name, "Flushed cache store");
                true
            }
            None => false,
        }
    }

    pub async fn flush_all(&self) {
        for (_, store) in self.snapshot() {
            store.flush().await;
        }
    }
}
