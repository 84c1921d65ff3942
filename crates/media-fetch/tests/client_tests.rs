//! Cached remote client tests against a wiremock upstream.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use media_fetch::{
    CacheRegistry, CacheStore, FetchConfig, FetchError, FetchResult, LimiterRegistry, Payload,
    RateLimit, RemoteClient, RequestOptions,
};

fn client_for(server: &MockServer, caches: &CacheRegistry) -> RemoteClient {
    RemoteClient::builder(server.uri())
        .cache(caches.store("tmdb"))
        .config(&FetchConfig::for_testing("unused"))
        .build()
        .unwrap()
}

// =============================================================================
// Read-through Cache
// =============================================================================

#[tokio::test]
async fn test_repeat_read_hits_network_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movie/603"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": 603, "title": "The Matrix"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let caches = CacheRegistry::default();
    let client = client_for(&server, &caches);
    let opts = RequestOptions::new().param("language", "en");

    let first = client.get("/movie/603", &opts).await.unwrap();
    let second = client.get("/movie/603", &opts).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.as_json().unwrap()["title"], "The Matrix");
}

#[tokio::test]
async fn test_ttl_zero_always_fetches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(3)
        .mount(&server)
        .await;

    let caches = CacheRegistry::default();
    let client = client_for(&server, &caches);
    let opts = RequestOptions::new().no_store();

    for _ in 0..3 {
        client.get("/queue", &opts).await.unwrap();
    }
    assert_eq!(caches.store("tmdb").entry_count().await, 0);
}

#[tokio::test]
async fn test_distinct_post_bodies_cached_separately() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/movie"))
        .and(body_json(json!({"tmdbId": 1})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 10})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/movie"))
        .and(body_json(json!({"tmdbId": 2})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 20})))
        .expect(1)
        .mount(&server)
        .await;

    let caches = CacheRegistry::default();
    let client = client_for(&server, &caches);
    let opts = RequestOptions::new();

    for _ in 0..2 {
        let a = client.post("/movie", &json!({"tmdbId": 1}), &opts).await.unwrap();
        let b = client.post("/movie", &json!({"tmdbId": 2}), &opts).await.unwrap();
        assert_eq!(a, Payload::Json(json!({"id": 10})));
        assert_eq!(b, Payload::Json(json!({"id": 20})));
    }
}

#[tokio::test]
async fn test_put_json_round_trip() {
    #[derive(Debug, Deserialize)]
    struct Series {
        id: u32,
        monitored: bool,
    }

    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/series/7"))
        .and(body_json(json!({"monitored": false})))
        .respond_with(
            ResponseTemplate::new(202).set_body_json(json!({"id": 7, "monitored": false})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let caches = CacheRegistry::default();
    let client = client_for(&server, &caches);

    let series: Series = client
        .put_json("/series/7", &json!({"monitored": false}), &RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(series.id, 7);
    assert!(!series.monitored);
    assert_eq!(caches.store("tmdb").entry_count().await, 1);
}

#[tokio::test]
async fn test_delete_is_never_cached() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/movie/10"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let caches = CacheRegistry::default();
    let client = client_for(&server, &caches);

    let first = client.delete("/movie/10", &RequestOptions::new()).await.unwrap();
    client.delete("/movie/10", &RequestOptions::new()).await.unwrap();
    assert!(first.is_empty());
}

#[tokio::test]
async fn test_invalidate_forces_refetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/system/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "4.0"})))
        .expect(2)
        .mount(&server)
        .await;

    let caches = CacheRegistry::default();
    let client = client_for(&server, &caches);
    let opts = RequestOptions::new().param("full", "true");

    client.get("/system/status", &opts).await.unwrap();
    client.invalidate("/system/status", &opts).await;
    client.get("/system/status", &opts).await.unwrap();
}

// =============================================================================
// Request Construction
// =============================================================================

#[tokio::test]
async fn test_default_params_merged_under_call_params() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search/movie"))
        .and(query_param("api_key", "k"))
        .and(query_param("language", "fr"))
        .and(query_param("query", "alien"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .expect(1)
        .mount(&server)
        .await;

    let client = RemoteClient::builder(server.uri())
        .default_params([("api_key", "k"), ("language", "en")])
        .build()
        .unwrap();
    let opts = RequestOptions::new().param("language", "fr").param("query", "alien");

    client.get("/search/movie", &opts).await.unwrap();
}

#[tokio::test]
async fn test_credentials_become_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/series"))
        .and(header("authorization", "Basic dXNlcjpwQHNz"))
        .and(header("x-api-key", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let host = server.uri().trim_start_matches("http://").to_string();
    let client = RemoteClient::builder(format!("http://user:p%40ss@{host}/api/v3"))
        .header("X-Api-Key", "abc")
        .build()
        .unwrap();

    assert!(!client.base_url().contains("p%40ss"));
    client.get("/series", &RequestOptions::new()).await.unwrap();
}

#[tokio::test]
async fn test_per_call_base_url_override() {
    let primary = MockServer::start().await;
    let mirror = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/artist/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "mirror"})))
        .expect(1)
        .mount(&mirror)
        .await;

    let client = RemoteClient::builder(primary.uri()).build().unwrap();
    let payload = client
        .get("/artist/1", &RequestOptions::new().base_url(mirror.uri()))
        .await
        .unwrap();

    assert_eq!(payload.as_json().unwrap()["name"], "mirror");
    assert!(primary.received_requests().await.unwrap().is_empty());
}

// =============================================================================
// Content Negotiation
// =============================================================================

#[tokio::test]
async fn test_text_plain_is_not_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{\"pong\":true}", "text/plain"))
        .mount(&server)
        .await;

    let client = RemoteClient::builder(server.uri()).build().unwrap();
    let payload = client.get("/ping", &RequestOptions::new()).await.unwrap();

    assert_eq!(payload, Payload::Text("{\"pong\":true}".to_string()));
}

#[tokio::test]
async fn test_xml_returned_as_text() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<rss/>", "application/rss+xml"))
        .mount(&server)
        .await;

    let client = RemoteClient::builder(server.uri()).build().unwrap();
    let payload = client.get("/feed", &RequestOptions::new()).await.unwrap();

    assert_eq!(payload.as_text(), Some("<rss/>"));
}

#[tokio::test]
async fn test_typed_get_json() {
    #[derive(Debug, Deserialize)]
    struct Movie {
        id: u32,
        title: String,
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movie/78"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": 78, "title": "Blade Runner"})),
        )
        .mount(&server)
        .await;

    let client = RemoteClient::builder(server.uri()).build().unwrap();
    let movie: Movie = client.get_json("/movie/78", &RequestOptions::new()).await.unwrap();

    assert_eq!(movie.id, 78);
    assert_eq!(movie.title, "Blade Runner");
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_non_2xx_raises_http_status_and_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movie/0"))
        .respond_with(ResponseTemplate::new(404).set_body_string("resource not found"))
        .expect(2)
        .mount(&server)
        .await;

    let caches = CacheRegistry::default();
    let client = client_for(&server, &caches);

    for _ in 0..2 {
        let err = client.get("/movie/0", &RequestOptions::new()).await.unwrap_err();
        match &err {
            FetchError::HttpStatus { status, status_text, body, url, .. } => {
                assert_eq!(*status, 404);
                assert_eq!(status_text, "Not Found");
                assert_eq!(body, "resource not found");
                assert!(url.ends_with("/movie/0"));
            }
            other => panic!("expected HttpStatus, got {other:?}"),
        }
        assert!(err.is_not_found());
    }
}

#[derive(Debug, Default)]
struct FailingStore {
    calls: AtomicUsize,
}

#[async_trait]
impl CacheStore for FailingStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, _key: &str) -> FetchResult<Option<Payload>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::cache_unavailable("redis", "connection refused"))
    }

    async fn set(&self, _key: &str, _value: Payload, _ttl: Duration) -> FetchResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::cache_unavailable("redis", "connection refused"))
    }

    async fn delete(&self, _key: &str) -> FetchResult<()> {
        Err(FetchError::cache_unavailable("redis", "connection refused"))
    }

    async fn remaining_ttl(&self, _key: &str) -> FetchResult<Option<Duration>> {
        Err(FetchError::cache_unavailable("redis", "connection refused"))
    }

    async fn entry_count(&self) -> u64 {
        0
    }

    async fn flush(&self) {}
}

#[tokio::test]
async fn test_store_failure_treated_as_miss() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/calendar"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2])))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(FailingStore::default());
    let caches = CacheRegistry::default();
    caches.register("redis", store.clone());
    let client = RemoteClient::builder(server.uri()).cache(caches.store("redis")).build().unwrap();

    for _ in 0..2 {
        let payload = client.get("/calendar", &RequestOptions::new()).await.unwrap();
        assert_eq!(payload, Payload::Json(json!([1, 2])));
    }
    client.invalidate("/calendar", &RequestOptions::new()).await;

    assert_eq!(store.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_retry_hook_recovers_from_transient_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let mut config = FetchConfig::for_testing("unused");
    config.max_retries = 1;
    let client = RemoteClient::builder(server.uri()).config(&config).build().unwrap();

    let payload = client.get("/flaky", &RequestOptions::new()).await.unwrap();
    assert_eq!(payload.as_json().unwrap()["ok"], true);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Records when each request reaches the server, then answers after a delay.
#[derive(Clone, Default)]
struct Arrivals(Arc<Mutex<Vec<Instant>>>);

impl Respond for Arrivals {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.0.lock().unwrap().push(Instant::now());
        ResponseTemplate::new(200).set_body_json(json!({})).set_delay(Duration::from_millis(100))
    }
}

#[tokio::test]
async fn test_rate_limited_client_bounds_in_flight_requests() {
    let server = MockServer::start().await;
    let arrivals = Arrivals::default();
    Mock::given(method("GET"))
        .and(path("/indexer"))
        .respond_with(arrivals.clone())
        .expect(4)
        .mount(&server)
        .await;

    let limiters = LimiterRegistry::new();
    let client = RemoteClient::builder(server.uri())
        .rate_limit("prowlarr", RateLimit::per_second(2), &limiters)
        .build()
        .unwrap();
    let opts = RequestOptions::new().no_store();

    let limiter = limiters.limiter("prowlarr", RateLimit::per_second(2));
    let peak = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let peak = Arc::clone(&peak);
        tokio::spawn(async move {
            loop {
                peak.fetch_max(limiter.snapshot().active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let start = Instant::now();
    let calls = (0..4).map(|_| client.get("/indexer", &opts));
    let results = futures::future::join_all(calls).await;
    sampler.abort();

    assert!(results.iter().all(Result::is_ok));
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(limiters.len(), 1);
    assert!(peak.load(Ordering::SeqCst) <= 2);

    // with two slots, the third and fourth requests wait for earlier responses
    let mut seen = arrivals.0.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen.len(), 4);
    assert!(seen[2] - seen[0] >= Duration::from_millis(90));
    assert!(seen[3] - seen[1] >= Duration::from_millis(90));
}
