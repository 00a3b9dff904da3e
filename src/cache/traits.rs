//! Core traits and types for the caching system.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::clock::duration_ms;
use crate::error::Result;

/// Values that can live in any backend, including the serialized ones.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A cached value and the epoch-ms instant after which it is no longer served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub value: T,
  pub expiry: i64,
}

impl<T> CacheEntry<T> {
  pub fn new(value: T, now_ms: i64, ttl: Duration) -> Self {
    Self {
      value,
      expiry: now_ms.saturating_add(duration_ms(ttl)),
    }
  }

  pub fn is_expired(&self, now_ms: i64) -> bool {
    now_ms > self.expiry
  }
}

/// Statistics about a cache instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub entries: usize,
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub expirations: u64,
}

/// Hit/miss bookkeeping shared by the store implementations.
#[derive(Debug, Default)]
pub(crate) struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
  expirations: AtomicU64,
}

impl Counters {
  pub(crate) fn hit(&self) {
    self.hits.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn evicted(&self) {
    self.evictions.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn expired(&self, count: u64) {
    self.expirations.fetch_add(count, Ordering::Relaxed);
  }

  pub(crate) fn snapshot(&self, entries: usize) -> CacheStats {
    CacheStats {
      entries,
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      expirations: self.expirations.load(Ordering::Relaxed),
    }
  }
}

/// Trait for TTL cache backends.
///
/// `get` returning `Ok(None)` means the key is absent or expired; an `Err`
/// means the backend itself failed.
#[async_trait]
pub trait CacheStore<T: Cacheable>: Send + Sync {
  /// Get a live value, removing it first if it has expired.
  async fn get(&self, key: &str) -> Result<Option<T>>;

  /// Store a value. `None` uses the store's default TTL.
  async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>;

  /// Remove a key. Returns whether it was present; absent keys are not an error.
  async fn delete(&self, key: &str) -> Result<bool>;

  async fn clear(&self) -> Result<()>;

  /// Number of stored entries, including expired ones not yet reclaimed.
  async fn size(&self) -> Result<usize>;

  /// Snapshot of stored keys at call time.
  async fn keys(&self) -> Result<Vec<String>>;

  /// Remove every expired entry. Returns how many were removed.
  async fn purge_expired(&self) -> Result<usize>;

  async fn stats(&self) -> Result<CacheStats>;
}
