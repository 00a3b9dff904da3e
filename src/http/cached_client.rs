//! HTTP client with transparent response caching and request de-duplication.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::cache::{request_key, ttl_for};
use super::client::{Fetcher, HttpFetcher};
use super::types::{HttpRequest, HttpResponse};
use crate::cache::{CacheManager, CacheStats, MemoryStore};
use crate::clock::SharedClock;
use crate::config::{HttpConfig, StorageKind};
use crate::error::{CacheError, Result};

type SharedFetch = Shared<BoxFuture<'static, Result<HttpResponse>>>;

struct Inner {
  store: CacheManager<HttpResponse>,
  fetcher: Arc<dyn Fetcher>,
  /// One in-flight network call per request signature
  pending: Mutex<HashMap<String, SharedFetch>>,
  default_ttl: Duration,
  timeout: Duration,
}

impl Inner {
  fn pending(&self) -> Result<MutexGuard<'_, HashMap<String, SharedFetch>>> {
    self.pending.lock().map_err(CacheError::lock_poisoned)
  }

  async fn fetch_and_store(&self, key: &str, request: &HttpRequest) -> Result<HttpResponse> {
    let response = tokio::time::timeout(self.timeout, self.fetcher.fetch(request))
      .await
      .map_err(|_| CacheError::Timeout(self.timeout))??;

    if request.method.is_cacheable() && response.status < 400 {
      let ttl = ttl_for(response.header("cache-control"), self.default_ttl);
      if ttl.is_zero() {
        debug!(url = %request.url, "Response has max-age=0, not caching");
      } else if let Err(e) = self.store.set(key, response.clone(), Some(ttl)).await {
        warn!(url = %request.url, error = %e, "Failed to cache response");
      }
    }

    Ok(response)
  }
}

/// HTTP client that serves repeated GETs from a TTL cache.
///
/// Concurrent misses for the same request share a single network call. The
/// call runs in its own task, so it completes and is cached even if every
/// caller gives up waiting.
#[derive(Clone)]
pub struct HttpCache {
  inner: Arc<Inner>,
}

impl HttpCache {
  pub fn new(store: CacheManager<HttpResponse>, fetcher: Arc<dyn Fetcher>, config: &HttpConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        fetcher,
        pending: Mutex::new(HashMap::new()),
        default_ttl: config.default_ttl(),
        timeout: config.request_timeout(),
      }),
    }
  }

  /// In-memory response cache in front of a real network client.
  pub fn from_config(config: &HttpConfig, clock: SharedClock) -> Result<Self> {
    let store = MemoryStore::new(config.default_ttl(), config.max_size, clock);
    let manager = CacheManager::with_store(Arc::new(store), StorageKind::Memory);
    let fetcher = Arc::new(HttpFetcher::new(config)?);
    Ok(Self::new(manager, fetcher, config))
  }

  pub async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
    let key = request_key(request);

    match self.inner.store.get(&key).await {
      Ok(Some(response)) => {
        debug!(url = %request.url, "Serving response from cache");
        return Ok(response);
      }
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, error = %e, "Cache read failed, treating as miss"),
    }

    let call = {
      let mut pending = self.inner.pending()?;
      match pending.get(&key) {
        Some(call) => {
          debug!(url = %request.url, "Joining in-flight request");
          call.clone()
        }
        None => {
          let call = self.spawn_fetch(key.clone(), request.clone());
          pending.insert(key, call.clone());
          call
        }
      }
    };

    call.await
  }

  fn spawn_fetch(&self, key: String, request: HttpRequest) -> SharedFetch {
    let inner = Arc::clone(&self.inner);

    let task = tokio::spawn(async move {
      let result = inner.fetch_and_store(&key, &request).await;
      match inner.pending() {
        Ok(mut pending) => {
          pending.remove(&key);
        }
        Err(e) => warn!(error = %e, "Failed to clear pending request"),
      }
      result
    });

    async move {
      match task.await {
        Ok(result) => result,
        Err(e) => Err(CacheError::Network(format!("Request task failed: {}", e))),
      }
    }
    .boxed()
    .shared()
  }

  /// Drop every cached response whose key contains `pattern`. Returns how
  /// many were removed.
  pub async fn invalidate(&self, pattern: &str) -> Result<usize> {
    let mut removed = 0;
    for key in self.inner.store.keys().await? {
      if key.contains(pattern) && self.inner.store.delete(&key).await? {
        removed += 1;
      }
    }
    debug!(pattern, removed, "Invalidated cached responses");
    Ok(removed)
  }

  pub async fn clear(&self) -> Result<()> {
    self.inner.store.clear().await
  }

  pub async fn stats(&self) -> Result<CacheStats> {
    self.inner.store.stats().await
  }

  /// Number of network calls currently in flight.
  pub fn in_flight(&self) -> usize {
    self.inner.pending().map(|p| p.len()).unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStore;
  use crate::clock::{self, ManualClock};
  use crate::http::client::mock::MockFetcher;
  use async_trait::async_trait;
  use crate::http::types::Method;

  fn cache_with(fetcher: Arc<MockFetcher>, clock: SharedClock) -> HttpCache {
    let config = HttpConfig::default();
    let store = MemoryStore::new(config.default_ttl(), config.max_size, clock);
    let manager = CacheManager::with_store(Arc::new(store), StorageKind::Memory);
    HttpCache::new(manager, fetcher, &config)
  }

  fn ok(body: &str) -> HttpResponse {
    HttpResponse::new(200).with_body(body)
  }

  #[test]
  fn test_from_config_uses_memory_store() {
    let cache = HttpCache::from_config(&HttpConfig::default(), clock::system()).unwrap();
    assert_eq!(cache.inner.store.kind(), StorageKind::Memory);
  }

  #[tokio::test]
  async fn test_hit_skips_network() {
    let mock = Arc::new(MockFetcher::new());
    mock.respond("http://x/a", ok("a"));
    let cache = cache_with(mock.clone(), clock::system());

    let first = cache.fetch(&HttpRequest::get("http://x/a")).await.unwrap();
    let second = cache.fetch(&HttpRequest::get("http://x/a")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(mock.calls(), 1);
    assert_eq!(cache.stats().await.unwrap().hits, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_misses_share_one_call() {
    let mock = Arc::new(MockFetcher::new().with_delay(Duration::from_millis(100)));
    mock.respond("http://x/a", ok("a"));
    let cache = cache_with(mock.clone(), clock::system());

    let req = HttpRequest::get("http://x/a");
    let (a, b) = tokio::join!(cache.fetch(&req), cache.fetch(&req));

    assert_eq!(a.unwrap().text(), "a");
    assert_eq!(b.unwrap().text(), "a");
    assert_eq!(mock.calls(), 1);
    assert_eq!(cache.in_flight(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_failures_reject_every_waiter() {
    let mock = Arc::new(MockFetcher::new().with_delay(Duration::from_millis(100)));
    mock.fail("http://x/a");
    let cache = cache_with(mock.clone(), clock::system());

    let req = HttpRequest::get("http://x/a");
    let (a, b) = tokio::join!(cache.fetch(&req), cache.fetch(&req));

    assert!(a.unwrap_err().is_network());
    assert!(b.unwrap_err().is_network());
    assert_eq!(mock.calls(), 1);
    assert_eq!(cache.in_flight(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_network_times_out() {
    let mock = Arc::new(MockFetcher::new().with_delay(Duration::from_secs(60)));
    mock.respond("http://x/a", ok("a"));
    let cache = cache_with(mock, clock::system());

    let err = cache
      .fetch(&HttpRequest::get("http://x/a"))
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::Timeout(d) if d == Duration::from_secs(30)));
  }

  #[tokio::test]
  async fn test_cache_control_max_age_sets_ttl() {
    let clock = Arc::new(ManualClock::new(0));
    let mock = Arc::new(MockFetcher::new());
    mock.respond(
      "http://x/a",
      ok("a").with_header("Cache-Control", "public, max-age=60"),
    );
    let cache = cache_with(mock.clone(), clock.clone());
    let req = HttpRequest::get("http://x/a");

    cache.fetch(&req).await.unwrap();
    clock.advance(Duration::from_millis(60_000));
    cache.fetch(&req).await.unwrap();
    assert_eq!(mock.calls(), 1);

    clock.advance(Duration::from_millis(1));
    cache.fetch(&req).await.unwrap();
    assert_eq!(mock.calls(), 2);
  }

  #[tokio::test]
  async fn test_default_ttl_without_max_age() {
    let clock = Arc::new(ManualClock::new(0));
    let mock = Arc::new(MockFetcher::new());
    mock.respond("http://x/a", ok("a"));
    let cache = cache_with(mock.clone(), clock.clone());
    let req = HttpRequest::get("http://x/a");

    cache.fetch(&req).await.unwrap();
    clock.advance(Duration::from_millis(300_000));
    cache.fetch(&req).await.unwrap();
    assert_eq!(mock.calls(), 1);

    clock.advance(Duration::from_millis(1));
    cache.fetch(&req).await.unwrap();
    assert_eq!(mock.calls(), 2);
  }

  #[tokio::test]
  async fn test_max_age_zero_is_not_cached() {
    let mock = Arc::new(MockFetcher::new());
    mock.respond("http://x/a", ok("a").with_header("cache-control", "max-age=0"));
    let cache = cache_with(mock.clone(), clock::system());

    cache.fetch(&HttpRequest::get("http://x/a")).await.unwrap();
    cache.fetch(&HttpRequest::get("http://x/a")).await.unwrap();
    assert_eq!(mock.calls(), 2);
  }

  #[tokio::test]
  async fn test_post_and_errors_are_not_cached() {
    let mock = Arc::new(MockFetcher::new());
    mock.respond("http://x/a", ok("a"));
    mock.respond("http://x/broken", HttpResponse::new(500));
    let cache = cache_with(mock.clone(), clock::system());

    let post = HttpRequest::new(Method::Post, "http://x/a").with_body("{}");
    cache.fetch(&post).await.unwrap();
    cache.fetch(&post).await.unwrap();
    assert_eq!(mock.calls_for("http://x/a"), 2);

    let broken = HttpRequest::get("http://x/broken");
    assert_eq!(cache.fetch(&broken).await.unwrap().status, 500);
    cache.fetch(&broken).await.unwrap();
    assert_eq!(mock.calls_for("http://x/broken"), 2);
  }

  #[tokio::test]
  async fn test_invalidate_by_substring() {
    let mock = Arc::new(MockFetcher::new());
    mock.respond("http://x/users/1", ok("u1"));
    mock.respond("http://x/users/2", ok("u2"));
    mock.respond("http://x/posts/1", ok("p1"));
    let cache = cache_with(mock.clone(), clock::system());

    for url in ["http://x/users/1", "http://x/users/2", "http://x/posts/1"] {
      cache.fetch(&HttpRequest::get(url)).await.unwrap();
    }

    assert_eq!(cache.invalidate("/users/").await.unwrap(), 2);
    assert_eq!(cache.stats().await.unwrap().entries, 1);

    cache.fetch(&HttpRequest::get("http://x/users/1")).await.unwrap();
    assert_eq!(mock.calls_for("http://x/users/1"), 2);
  }

  #[tokio::test]
  async fn test_header_order_shares_cache_entry() {
    let mock = Arc::new(MockFetcher::new());
    mock.respond("http://x/a", ok("a"));
    let cache = cache_with(mock.clone(), clock::system());

    let a = HttpRequest::get("http://x/a")
      .with_header("Accept", "json")
      .with_header("X-Id", "1");
    let b = HttpRequest::get("http://x/a")
      .with_header("x-id", "1")
      .with_header("accept", "json");

    cache.fetch(&a).await.unwrap();
    cache.fetch(&b).await.unwrap();
    assert_eq!(mock.calls(), 1);
  }

  struct BrokenStore;

  fn broken() -> CacheError {
    CacheError::Storage("disk unavailable".to_string())
  }

  #[async_trait]
  impl CacheStore<HttpResponse> for BrokenStore {
    async fn get(&self, _key: &str) -> Result<Option<HttpResponse>> {
      Err(broken())
    }
    async fn set(&self, _key: &str, _value: HttpResponse, _ttl: Option<Duration>) -> Result<()> {
      Err(broken())
    }
    async fn delete(&self, _key: &str) -> Result<bool> {
      Err(broken())
    }
    async fn clear(&self) -> Result<()> {
      Err(broken())
    }
    async fn size(&self) -> Result<usize> {
      Err(broken())
    }
    async fn keys(&self) -> Result<Vec<String>> {
      Err(broken())
    }
    async fn purge_expired(&self) -> Result<usize> {
      Err(broken())
    }
    async fn stats(&self) -> Result<CacheStats> {
      Err(broken())
    }
  }

  #[tokio::test]
  async fn test_failing_store_falls_through_to_network() {
    let mock = Arc::new(MockFetcher::new());
    mock.respond("http://x/a", ok("a"));
    let manager = CacheManager::with_store(Arc::new(BrokenStore), StorageKind::Local);
    let cache = HttpCache::new(manager, mock.clone(), &HttpConfig::default());

    let first = cache.fetch(&HttpRequest::get("http://x/a")).await.unwrap();
    let second = cache.fetch(&HttpRequest::get("http://x/a")).await.unwrap();

    assert_eq!(first.text(), "a");
    assert_eq!(second.text(), "a");
    assert_eq!(mock.calls(), 2);
  }
}
