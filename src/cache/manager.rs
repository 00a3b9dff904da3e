//! Backend-agnostic cache façade.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::memory::MemoryStore;
use super::storage::SqliteStore;
use super::traits::{CacheStats, CacheStore, Cacheable};
use crate::clock::SharedClock;
use crate::config::{CacheConfig, StorageKind};
use crate::db::Database;
use crate::error::Result;

/// Cache façade that picks a backend once, at construction, and delegates
/// every operation to it.
pub struct CacheManager<T: Cacheable> {
  store: Arc<dyn CacheStore<T>>,
  kind: StorageKind,
}

impl<T: Cacheable> CacheManager<T> {
  /// Build the backend selected by `config.storage`.
  ///
  /// `database_path` is only consulted for `StorageKind::Local`; `None` means
  /// the default data directory.
  pub fn open(config: &CacheConfig, database_path: Option<&Path>, clock: SharedClock) -> Result<Self> {
    let store: Arc<dyn CacheStore<T>> = match config.storage {
      StorageKind::Memory => Arc::new(MemoryStore::new(
        config.default_ttl(),
        config.max_size,
        clock,
      )),
      StorageKind::Local => {
        let db = Database::open(database_path)?;
        Arc::new(
          SqliteStore::new(db, &config.namespace, config.default_ttl(), clock)
            .with_quota(config.quota_bytes),
        )
      }
      StorageKind::Session => {
        let db = Database::open_in_memory()?;
        Arc::new(
          SqliteStore::new(db, &config.namespace, config.default_ttl(), clock)
            .with_quota(config.quota_bytes),
        )
      }
    };

    info!(storage = ?config.storage, "Cache manager ready");
    Ok(Self {
      store,
      kind: config.storage,
    })
  }

  /// Wrap an already-built store.
  pub fn with_store(store: Arc<dyn CacheStore<T>>, kind: StorageKind) -> Self {
    Self { store, kind }
  }

  pub fn kind(&self) -> StorageKind {
    self.kind
  }

  pub async fn get(&self, key: &str) -> Result<Option<T>> {
    self.store.get(key).await
  }

  pub async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()> {
    self.store.set(key, value, ttl).await
  }

  pub async fn delete(&self, key: &str) -> Result<bool> {
    self.store.delete(key).await
  }

  pub async fn clear(&self) -> Result<()> {
    self.store.clear().await
  }

  pub async fn size(&self) -> Result<usize> {
    self.store.size().await
  }

  pub async fn keys(&self) -> Result<Vec<String>> {
    self.store.keys().await
  }

  pub async fn purge_expired(&self) -> Result<usize> {
    self.store.purge_expired().await
  }

  pub async fn stats(&self) -> Result<CacheStats> {
    self.store.stats().await
  }
}

impl<T: Cacheable> Clone for CacheManager<T> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      kind: self.kind,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::{self, ManualClock};
  use serde_json::{json, Value};
  use tempfile::tempdir;

  fn config(storage: StorageKind) -> CacheConfig {
    CacheConfig {
      storage,
      max_size: 2,
      ..CacheConfig::default()
    }
  }

  #[tokio::test]
  async fn test_memory_backend_delegates() {
    let manager: CacheManager<Value> =
      CacheManager::open(&config(StorageKind::Memory), None, clock::system()).unwrap();
    assert_eq!(manager.kind(), StorageKind::Memory);

    manager.set("a", json!({"n": 1}), None).await.unwrap();
    assert_eq!(manager.get("a").await.unwrap(), Some(json!({"n": 1})));
    assert_eq!(manager.size().await.unwrap(), 1);

    // max_size = 2 applies to the memory backend
    manager.set("b", json!(2), None).await.unwrap();
    manager.set("c", json!(3), None).await.unwrap();
    assert_eq!(manager.size().await.unwrap(), 2);
    assert_eq!(manager.get("a").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_session_backend_is_private_per_manager() {
    let first: CacheManager<Value> =
      CacheManager::open(&config(StorageKind::Session), None, clock::system()).unwrap();
    let second: CacheManager<Value> =
      CacheManager::open(&config(StorageKind::Session), None, clock::system()).unwrap();

    first.set("a", json!("x"), None).await.unwrap();
    assert_eq!(second.get("a").await.unwrap(), None);

    // Clones share the same session
    let clone = first.clone();
    assert_eq!(clone.get("a").await.unwrap(), Some(json!("x")));
  }

  #[tokio::test]
  async fn test_local_backend_persists_across_managers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let cfg = config(StorageKind::Local);

    {
      let manager: CacheManager<Value> =
        CacheManager::open(&cfg, Some(&path), clock::system()).unwrap();
      manager.set("token", json!("abc"), None).await.unwrap();
    }

    let manager: CacheManager<Value> =
      CacheManager::open(&cfg, Some(&path), clock::system()).unwrap();
    assert_eq!(manager.get("token").await.unwrap(), Some(json!("abc")));
    assert_eq!(manager.keys().await.unwrap(), vec!["token"]);
  }

  #[tokio::test]
  async fn test_expiry_through_facade() {
    let clock = Arc::new(ManualClock::new(0));
    let manager: CacheManager<Value> =
      CacheManager::open(&config(StorageKind::Session), None, clock.clone()).unwrap();

    manager
      .set("a", json!(1), Some(Duration::from_secs(1)))
      .await
      .unwrap();
    clock.advance(Duration::from_millis(1_001));

    assert_eq!(manager.get("a").await.unwrap(), None);
    assert!(!manager.delete("a").await.unwrap());
  }
}
