//! SQLite-backed persistent TTL store.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::{CacheEntry, CacheStats, CacheStore, Cacheable, Counters};
use crate::clock::SharedClock;
use crate::db::Database;
use crate::error::{CacheError, Result};

/// Persistent cache storage implementation.
///
/// Entries are serialized as JSON `{value, expiry}` rows under this store's
/// namespace. There is no LRU bookkeeping: when a write would exceed the
/// quota, expired rows are swept and the write is retried once.
pub struct SqliteStore<T> {
  db: Database,
  namespace: String,
  default_ttl: Duration,
  quota_bytes: Option<u64>,
  clock: SharedClock,
  counters: Arc<Counters>,
  _marker: PhantomData<fn() -> T>,
}

impl<T: Cacheable> SqliteStore<T> {
  pub fn new(db: Database, namespace: &str, default_ttl: Duration, clock: SharedClock) -> Self {
    Self {
      db,
      namespace: namespace.to_string(),
      default_ttl,
      quota_bytes: None,
      clock,
      counters: Arc::new(Counters::default()),
      _marker: PhantomData,
    }
  }

  /// Cap the total serialized bytes stored under this namespace.
  pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
    self.quota_bytes = quota_bytes;
    self
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  fn write(&self, key: &str, data: &[u8], expiry: i64, now: i64) -> Result<()> {
    self.db.with_conn(|conn| {
      if let Some(quota) = self.quota_bytes {
        let used: i64 = conn.query_row(
          "SELECT COALESCE(SUM(LENGTH(data)), 0) FROM kv_cache
           WHERE namespace = ? AND cache_key != ?",
          params![self.namespace, key],
          |row| row.get(0),
        )?;

        let needed = used.max(0) as u64 + data.len() as u64;
        if needed > quota {
          return Err(CacheError::QuotaExceeded(format!(
            "namespace '{}' needs {} bytes, quota is {}",
            self.namespace, needed, quota
          )));
        }
      }

      conn.execute(
        "INSERT OR REPLACE INTO kv_cache (namespace, cache_key, data, expiry, stored_at)
         VALUES (?, ?, ?, ?, ?)",
        params![self.namespace, key, data, expiry, now],
      )?;

      Ok(())
    })
  }

  fn sweep(&self, now: i64) -> Result<usize> {
    let removed = self.db.with_conn(|conn| {
      Ok(conn.execute(
        "DELETE FROM kv_cache WHERE namespace = ? AND expiry < ?",
        params![self.namespace, now],
      )?)
    })?;

    self.counters.expired(removed as u64);
    Ok(removed)
  }

  fn remove(&self, key: &str) -> Result<bool> {
    let removed = self.db.with_conn(|conn| {
      Ok(conn.execute(
        "DELETE FROM kv_cache WHERE namespace = ? AND cache_key = ?",
        params![self.namespace, key],
      )?)
    })?;
    Ok(removed > 0)
  }
}

#[async_trait]
impl<T: Cacheable> CacheStore<T> for SqliteStore<T> {
  async fn get(&self, key: &str) -> Result<Option<T>> {
    let now = self.clock.now_ms();

    let data: Option<Vec<u8>> = self.db.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT data FROM kv_cache WHERE namespace = ? AND cache_key = ?",
            params![self.namespace, key],
            |row| row.get(0),
          )
          .optional()?,
      )
    })?;

    let Some(data) = data else {
      self.counters.miss();
      return Ok(None);
    };

    let entry: CacheEntry<T> = match serde_json::from_slice(&data) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(namespace = %self.namespace, key = %key, error = %e, "Discarding unreadable cache entry");
        self.remove(key)?;
        self.counters.miss();
        return Ok(None);
      }
    };

    if entry.is_expired(now) {
      self.remove(key)?;
      self.counters.expired(1);
      self.counters.miss();
      debug!(namespace = %self.namespace, key = %key, "Cache entry expired");
      return Ok(None);
    }

    self.counters.hit();
    Ok(Some(entry.value))
  }

  async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()> {
    let now = self.clock.now_ms();
    let entry = CacheEntry::new(value, now, ttl.unwrap_or(self.default_ttl));
    let data = serde_json::to_vec(&entry)?;

    match self.write(key, &data, entry.expiry, now) {
      Err(e) if e.is_quota_exceeded() => {
        let swept = self.sweep(now)?;
        warn!(
          namespace = %self.namespace,
          key = %key,
          swept,
          "Storage quota exceeded, retrying after sweeping expired entries"
        );
        self.write(key, &data, entry.expiry, now)
      }
      other => other,
    }
  }

  async fn delete(&self, key: &str) -> Result<bool> {
    self.remove(key)
  }

  async fn clear(&self) -> Result<()> {
    self.db.with_conn(|conn| {
      conn.execute(
        "DELETE FROM kv_cache WHERE namespace = ?",
        params![self.namespace],
      )?;
      Ok(())
    })
  }

  async fn size(&self) -> Result<usize> {
    let count: i64 = self.db.with_conn(|conn| {
      Ok(conn.query_row(
        "SELECT COUNT(*) FROM kv_cache WHERE namespace = ?",
        params![self.namespace],
        |row| row.get(0),
      )?)
    })?;
    Ok(count.max(0) as usize)
  }

  async fn keys(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT cache_key FROM kv_cache WHERE namespace = ?
         ORDER BY stored_at, cache_key",
      )?;
      let keys = stmt
        .query_map(params![self.namespace], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      Ok(keys)
    })
  }

  async fn purge_expired(&self) -> Result<usize> {
    self.sweep(self.clock.now_ms())
  }

  async fn stats(&self) -> Result<CacheStats> {
    let entries = self.size().await?;
    Ok(self.counters.snapshot(entries))
  }
}
