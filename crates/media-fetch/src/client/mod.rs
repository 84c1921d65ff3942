//! Cached remote client for third-party REST/JSON and text APIs.
//!
//! Provides async HTTP client with:
//! - Connection pooling via reqwest
//! - Optional rate limiting through a shared [`RateLimiter`]
//! - Read-through caching in a pluggable [`CacheStore`]
//! - Stale-while-revalidate reads via [`RemoteClient::get_rolling`]

mod payload;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

pub use payload::Payload;

use crate::cache::CacheStore;
use crate::config::{FetchConfig, defaults};
use crate::error::{FetchError, FetchResult};
use crate::limiter::{LimiterRegistry, RateLimit, RateLimiter};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Query parameters, merged over the client defaults.
    pub params: Vec<(String, String)>,

    /// Cache TTL. `None` uses the client default; zero skips the cache write.
    /// Values above [`defaults::MAX_CACHE_TTL`] are clamped.
    pub ttl: Option<Duration>,

    /// Extra headers for this call only.
    pub headers: HeaderMap,

    /// Base URL replacing the client's for this call.
    pub base_url: Option<String>,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Fetch without storing the response.
    #[must_use]
    pub fn no_store(self) -> Self {
        self.ttl(Duration::ZERO)
    }

    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// Builder for [`RemoteClient`].
#[derive(Debug)]
pub struct RemoteClientBuilder {
    base_url: String,
    params: BTreeMap<String, String>,
    headers: Vec<(String, String)>,
    limiter: Option<RateLimiter>,
    cache: Option<Arc<dyn CacheStore>>,
    config: FetchConfig,
}

impl RemoteClientBuilder {
    /// Add a query parameter sent with every request.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    #[must_use]
    pub fn default_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        for (k, v) in params {
            self.params.insert(k.into(), v.to_string());
        }
        self
    }

    /// Add a default header; later values replace earlier ones.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Route requests through the shared limiter for `id`.
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
    pub fn cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    #[must_use]
    pub fn config(mut self, config: &FetchConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns error if the base URL or a header does not parse, or the HTTP
    /// client cannot be initialised.
    pub fn build(self) -> FetchResult<RemoteClient> {
        let (base_url, credentials) = split_credentials(&self.base_url)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(credentials) = credentials {
            let value = format!("Basic {}", STANDARD.encode(credentials));
            headers.insert(AUTHORIZATION, parse_header_value(&value)?);
        }

        extend_headers(&mut headers, &self.headers)?;

        Ok(RemoteClient {
            http: http_client(headers, &self.config)?,
            base_url,
            params: self.params,
            limiter: self.limiter,
            cache: self.cache,
            default_ttl: self.config.default_ttl,
            rolling_buffer: self.config.rolling_buffer,
        })
    }
}

/// Reusable client for one upstream API.
#[derive(Clone)]
pub struct RemoteClient {
    /// HTTP client with middleware.
    http: ClientWithMiddleware,

    /// Base URL with any credentials removed.
    base_url: String,

    /// Default query parameters.
    params: BTreeMap<String, String>,

    /// Shared limiter wrapping every network call.
    limiter: Option<RateLimiter>,

    /// Response cache.
    cache: Option<Arc<dyn CacheStore>>,

    default_ttl: Duration,

    rolling_buffer: Duration,
}

impl RemoteClient {
    /// Start building a client for `base_url`.
    #[must_use]
    pub fn builder(base_url: impl Into<String>) -> RemoteClientBuilder {
        RemoteClientBuilder {
            base_url: base_url.into(),
            params: BTreeMap::new(),
            headers: Vec::new(),
            limiter: None,
            cache: None,
            config: FetchConfig::default(),
        }
    }

    /// Base URL requests are sent to, without credentials.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Read `endpoint`, serving from cache when possible.
    pub async fn get(&self, endpoint: &str, opts: &RequestOptions) -> FetchResult<Payload> {
        let base_url = self.effective_base(opts);
        let params = self.merged_params(&opts.params);
        let cache_key = request_key(&Method::GET, &base_url, endpoint, &params, None);

        if let Some(hit) = self.cache_get(&cache_key).await {
            tracing::debug!(endpoint, %cache_key, "Cache hit");
            return Ok(hit);
        }

        let payload =
            self.fetch(Method::GET, &base_url, endpoint, &params, None, &opts.headers).await?;
        self.cache_set(&cache_key, &payload, self.ttl_for(opts)).await;

        Ok(payload)
    }

    /// Create via POST. The body is part of the cache key.
    pub async fn post<B>(
        &self,
        endpoint: &str,
        body: &B,
        opts: &RequestOptions,
    ) -> FetchResult<Payload>
    where
        B: Serialize + ?Sized,
    {
        self.write(Method::POST, endpoint, serde_json::to_value(body)?, opts).await
    }

    /// Update via PUT. The body is part of the cache key.
    pub async fn put<B>(
        &self,
        endpoint: &str,
        body: &B,
        opts: &RequestOptions,
    ) -> FetchResult<Payload>
    where
        B: Serialize + ?Sized,
    {
        self.write(Method::PUT, endpoint, serde_json::to_value(body)?, opts).await
    }

    /// Remove via DELETE. Never cached.
    pub async fn delete(&self, endpoint: &str, opts: &RequestOptions) -> FetchResult<Payload> {
        let base_url = self.effective_base(opts);
        let params = self.merged_params(&opts.params);
        self.fetch(Method::DELETE, &base_url, endpoint, &params, None, &opts.headers).await
    }

    /// Stale-while-revalidate read.
    ///
    /// A cached value is returned immediately. Once the entry is older than
    /// the rolling buffer a background task refetches it and replaces the
    /// entry; the caller never waits for or sees that refresh.
    pub async fn get_rolling(&self, endpoint: &str, opts: &RequestOptions) -> FetchResult<Payload> {
        let base_url = self.effective_base(opts);
        let params = self.merged_params(&opts.params);
        let cache_key = request_key(&Method::GET, &base_url, endpoint, &params, None);
        let ttl = self.ttl_for(opts);

        if let Some(hit) = self.cache_get(&cache_key).await {
            let remaining = self.cache_remaining(&cache_key).await.unwrap_or_default();
            if remaining.saturating_add(self.rolling_buffer) < ttl {
                tracing::debug!(endpoint, %cache_key, ?remaining, "Rolling refresh");
                let headers = opts.headers.clone();
                self.spawn_refresh(cache_key, base_url, endpoint.to_string(), params, headers, ttl);
            }
            return Ok(hit);
        }

        let payload =
            self.fetch(Method::GET, &base_url, endpoint, &params, None, &opts.headers).await?;
        self.cache_set(&cache_key, &payload, ttl).await;

        Ok(payload)
    }

    /// Drop the cached read of `endpoint` with `opts.params`.
    pub async fn invalidate(&self, endpoint: &str, opts: &RequestOptions) {
        let Some(cache) = &self.cache else {
            return;
        };
        let cache_key = self.cache_key(&Method::GET, endpoint, opts, None);

        if let Err(e) = cache.delete(&cache_key).await {
            tracing::warn!(store = cache.name(), error = %e, "Cache delete failed");
        }
    }

    /// The cache key a call with these inputs reads and writes.
    #[must_use]
    pub fn cache_key(
        &self,
        method: &Method,
        endpoint: &str,
        opts: &RequestOptions,
        body: Option<&serde_json::Value>,
    ) -> String {
        let base_url = self.effective_base(opts);
        let params = self.merged_params(&opts.params);
        request_key(method, &base_url, endpoint, &params, body)
    }

    /// [`get`](Self::get) deserialized into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        opts: &RequestOptions,
    ) -> FetchResult<T> {
        self.get(endpoint, opts).await?.into_json()
    }

    /// [`get_rolling`](Self::get_rolling) deserialized into `T`.
    pub async fn get_rolling_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        opts: &RequestOptions,
    ) -> FetchResult<T> {
        self.get_rolling(endpoint, opts).await?.into_json()
    }

    /// [`post`](Self::post) deserialized into `T`.
    pub async fn post_json<B, T>(
        &self,
        endpoint: &str,
        body: &B,
        opts: &RequestOptions,
    ) -> FetchResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post(endpoint, body, opts).await?.into_json()
    }

    /// [`put`](Self::put) deserialized into `T`.
    pub async fn put_json<B, T>(
        &self,
        endpoint: &str,
        body: &B,
        opts: &RequestOptions,
    ) -> FetchResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.put(endpoint, body, opts).await?.into_json()
    }

    async fn write(
        &self,
        method: Method,
        endpoint: &str,
        body: serde_json::Value,
        opts: &RequestOptions,
    ) -> FetchResult<Payload> {
        let base_url = self.effective_base(opts);
        let params = self.merged_params(&opts.params);
        let cache_key = request_key(&method, &base_url, endpoint, &params, Some(&body));

        if let Some(hit) = self.cache_get(&cache_key).await {
            tracing::debug!(endpoint, %cache_key, "Cache hit");
            return Ok(hit);
        }

        let payload =
            self.fetch(method, &base_url, endpoint, &params, Some(body), &opts.headers).await?;
        self.cache_set(&cache_key, &payload, self.ttl_for(opts)).await;

        Ok(payload)
    }

    /// Issue one request, through the limiter when configured.
    async fn fetch(
        &self,
        method: Method,
        base_url: &str,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        body: Option<serde_json::Value>,
        headers: &HeaderMap,
    ) -> FetchResult<Payload> {
        let url = join_url(base_url, endpoint);
        tracing::debug!(%method, %url, "Fetching");

        let mut request =
            self.http.request(method, url.as_str()).query(params).headers(headers.clone());
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = send(self.limiter.as_ref(), request).await?;
        payload::decode(response).await
    }

    fn spawn_refresh(
        &self,
        cache_key: String,
        base_url: String,
        endpoint: String,
        params: BTreeMap<String, String>,
        headers: HeaderMap,
        ttl: Duration,
    ) {
        let client = self.clone();
        tokio::spawn(async move {
            match client.fetch(Method::GET, &base_url, &endpoint, &params, None, &headers).await {
                Ok(payload) => client.cache_set(&cache_key, &payload, ttl).await,
                Err(e) => {
                    tracing::warn!(%endpoint, %cache_key, error = %e, "Background refresh failed");
                }
            }
        });
    }

    async fn cache_get(&self, key: &str) -> Option<Payload> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(
                    store = cache.name(),
                    error = %e,
                    "Cache read failed, treating as miss"
                );
                None
            }
        }
    }

    async fn cache_remaining(&self, key: &str) -> Option<Duration> {
        let cache = self.cache.as_ref()?;
        cache.remaining_ttl(key).await.ok().flatten()
    }

    async fn cache_set(&self, key: &str, payload: &Payload, ttl: Duration) {
        let Some(cache) = &self.cache else {
            return;
        };
        if ttl.is_zero() {
            return;
        }
        if let Err(e) = cache.set(key, payload.clone(), ttl).await {
            tracing::warn!(store = cache.name(), error = %e, "Cache write failed");
        }
    }

    fn effective_base(&self, opts: &RequestOptions) -> String {
        opts.base_url
            .as_deref()
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| self.base_url.clone())
    }

    fn merged_params(&self, params: &[(String, String)]) -> BTreeMap<String, String> {
        let mut merged = self.params.clone();
        merged.extend(params.iter().cloned());
        merged
    }

    fn ttl_for(&self, opts: &RequestOptions) -> Duration {
        opts.ttl.unwrap_or(self.default_ttl).min(defaults::MAX_CACHE_TTL)
    }
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base_url", &self.base_url)
            .field("has_cache", &self.cache.is_some())
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

/// Build the pooled HTTP client shared by clients and image proxies.
pub(crate) fn http_client(
    headers: HeaderMap,
    config: &FetchConfig,
) -> FetchResult<ClientWithMiddleware> {
    let client = Client::builder()
        .default_headers(headers)
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .pool_max_idle_per_host(defaults::MAX_KEEPALIVE)
        .pool_idle_timeout(defaults::KEEPALIVE_EXPIRY)
        .gzip(true)
        .build()?;

    let mut builder = ClientBuilder::new(client);
    if config.max_retries > 0 {
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_secs(1), Duration::from_secs(30))
            .build_with_max_retries(config.max_retries);
        builder = builder.with(RetryTransientMiddleware::new_with_policy(retry_policy));
    }

    Ok(builder.build())
}

/// Send `request`, through `limiter` when given, and reject non-2xx responses.
pub(crate) async fn send(
    limiter: Option<&RateLimiter>,
    request: RequestBuilder,
) -> FetchResult<reqwest::Response> {
    let response = match limiter {
        Some(limiter) => limiter.run(move || request.send()).await??,
        None => request.send().await?,
    };

    handle_response(response).await
}

/// Turn a non-2xx response into [`FetchError::HttpStatus`].
async fn handle_response(response: reqwest::Response) -> FetchResult<reqwest::Response> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();

    tracing::debug!(status = status.as_u16(), %url, "Upstream error");
    Err(FetchError::http_status(status, body, url, headers))
}

/// Generate cache key.
fn request_key(
    method: &Method,
    base_url: &str,
    endpoint: &str,
    params: &BTreeMap<String, String>,
    body: Option<&serde_json::Value>,
) -> String {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(base_url.as_bytes());
    hasher.update(endpoint.as_bytes());
    hasher.update(b"|");
    hasher.update(serde_json::to_string(params).unwrap_or_default().as_bytes());

    if let Some(body) = body {
        hasher.update(b"|");
        hasher.update(body.to_string().as_bytes());
    }

    format!("{:x}", hasher.finalize())
}

pub(crate) fn join_url(base_url: &str, endpoint: &str) -> String {
    if endpoint.is_empty() || endpoint.starts_with('/') {
        format!("{base_url}{endpoint}")
    } else {
        format!("{base_url}/{endpoint}")
    }
}

/// Strip `user:pass@` from `raw`, returning the clean URL and the decoded credentials.
fn split_credentials(raw: &str) -> FetchResult<(String, Option<String>)> {
    let mut url = Url::parse(raw)?;

    let credentials = if url.username().is_empty() && url.password().is_none() {
        None
    } else {
        let user = urlencoding::decode(url.username())
            .map_err(|e| FetchError::InvalidHeader(format!("username: {e}")))?
            .into_owned();
        let pass = urlencoding::decode(url.password().unwrap_or_default())
            .map_err(|e| FetchError::InvalidHeader(format!("password: {e}")))?
            .into_owned();
        // a URL carrying credentials always has a host, so these cannot fail
        let _ = url.set_username("");
        let _ = url.set_password(None);
        Some(format!("{user}:{pass}"))
    };

    Ok((url.as_str().trim_end_matches('/').to_string(), credentials))
}

/// Insert `extra` into `headers`, replacing existing values.
pub(crate) fn extend_headers(
    headers: &mut HeaderMap,
    extra: &[(String, String)],
) -> FetchResult<()> {
    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| FetchError::InvalidHeader(format!("{name}: {e}")))?;
        headers.insert(name, parse_header_value(value)?);
    }
    Ok(())
}

fn parse_header_value(value: &str) -> FetchResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| FetchError::InvalidHeader(e.to_string()))
}
