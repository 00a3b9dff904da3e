//! Bounded in-memory store with TTL expiry and LRU eviction.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

use super::traits::{CacheEntry, CacheStats, CacheStore, Cacheable, Counters};
use crate::clock::SharedClock;
use crate::error::{CacheError, Result};

struct MemoryState<T> {
  entries: HashMap<String, CacheEntry<T>>,
  /// Last access per key, as a monotonically increasing sequence number
  access: HashMap<String, u64>,
  /// Pending proactive-expiry timer per key, tagged with the write that armed it
  timers: HashMap<String, (u64, AbortHandle)>,
  next_seq: u64,
  next_generation: u64,
}

impl<T> MemoryState<T> {
  fn new() -> Self {
    Self {
      entries: HashMap::new(),
      access: HashMap::new(),
      timers: HashMap::new(),
      next_seq: 0,
      next_generation: 0,
    }
  }

  fn touch(&mut self, key: &str) {
    self.next_seq += 1;
    self.access.insert(key.to_string(), self.next_seq);
  }

  fn least_recently_used(&self) -> Option<String> {
    self
      .access
      .iter()
      .min_by_key(|(_, seq)| **seq)
      .map(|(key, _)| key.clone())
  }

  fn remove(&mut self, key: &str) -> bool {
    if let Some((_, timer)) = self.timers.remove(key) {
      timer.abort();
    }
    self.access.remove(key);
    self.entries.remove(key).is_some()
  }

  fn clear(&mut self) {
    for (_, (_, timer)) in self.timers.drain() {
      timer.abort();
    }
    self.access.clear();
    self.entries.clear();
  }
}

impl<T> Drop for MemoryState<T> {
  fn drop(&mut self) {
    for (_, (_, timer)) in self.timers.drain() {
      timer.abort();
    }
  }
}

/// In-memory TTL cache holding at most `max_size` entries.
///
/// Expiry is enforced lazily in `get`. A per-key tokio timer additionally
/// reclaims memory for entries nobody reads again.
pub struct MemoryStore<T> {
  state: Arc<Mutex<MemoryState<T>>>,
  counters: Arc<Counters>,
  clock: SharedClock,
  default_ttl: Duration,
  max_size: usize,
}

impl<T: Cacheable> MemoryStore<T> {
  pub fn new(default_ttl: Duration, max_size: usize, clock: SharedClock) -> Self {
    Self {
      state: Arc::new(Mutex::new(MemoryState::new())),
      counters: Arc::new(Counters::default()),
      clock,
      default_ttl,
      max_size,
    }
  }

  pub fn max_size(&self) -> usize {
    self.max_size
  }

  fn lock(&self) -> Result<MutexGuard<'_, MemoryState<T>>> {
    self.state.lock().map_err(CacheError::lock_poisoned)
  }

  /// Remove `key` after `ttl` unless a later write re-armed its timer.
  fn schedule_expiry(&self, key: String, generation: u64, ttl: Duration) -> AbortHandle {
    let state: Weak<Mutex<MemoryState<T>>> = Arc::downgrade(&self.state);
    let counters = Arc::clone(&self.counters);

    tokio::spawn(async move {
      tokio::time::sleep(ttl).await;

      let Some(shared) = state.upgrade() else {
        return;
      };
      let Ok(mut state) = shared.lock() else {
        return;
      };

      if state.timers.get(&key).is_some_and(|(g, _)| *g == generation) {
        // Drop our own handle first so `remove` does not abort this task
        state.timers.remove(&key);
        state.remove(&key);
        counters.expired(1);
        debug!(key = %key, "Expired cache entry reclaimed by timer");
      }
    })
    .abort_handle()
  }
}

#[async_trait]
impl<T: Cacheable> CacheStore<T> for MemoryStore<T> {
  async fn get(&self, key: &str) -> Result<Option<T>> {
    let now = self.clock.now_ms();
    let mut state = self.lock()?;

    let expired = match state.entries.get(key) {
      None => {
        self.counters.miss();
        return Ok(None);
      }
      Some(entry) => entry.is_expired(now),
    };

    if expired {
      state.remove(key);
      self.counters.expired(1);
      self.counters.miss();
      debug!(key = %key, "Cache entry expired");
      return Ok(None);
    }

    let value = state.entries.get(key).map(|e| e.value.clone());
    state.touch(key);
    self.counters.hit();
    Ok(value)
  }

  async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()> {
    if self.max_size == 0 {
      return Ok(());
    }

    let ttl = ttl.unwrap_or(self.default_ttl);
    let now = self.clock.now_ms();
    let entry = CacheEntry::new(value, now, ttl);

    let mut state = self.lock()?;

    if !state.entries.contains_key(key) && state.entries.len() >= self.max_size {
      if let Some(victim) = state.least_recently_used() {
        state.remove(&victim);
        self.counters.evicted();
        debug!(key = %victim, "Evicted least recently used cache entry");
      }
    }

    state.entries.insert(key.to_string(), entry);
    state.touch(key);

    state.next_generation += 1;
    let generation = state.next_generation;
    let timer = self.schedule_expiry(key.to_string(), generation, ttl);
    if let Some((_, previous)) = state.timers.insert(key.to_string(), (generation, timer)) {
      previous.abort();
    }

    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<bool> {
    Ok(self.lock()?.remove(key))
  }

  async fn clear(&self) -> Result<()> {
    self.lock()?.clear();
    Ok(())
  }

  async fn size(&self) -> Result<usize> {
    Ok(self.lock()?.entries.len())
  }

  async fn keys(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.entries.keys().cloned().collect())
  }

  async fn purge_expired(&self) -> Result<usize> {
    let now = self.clock.now_ms();
    let mut state = self.lock()?;

    let expired: Vec<String> = state
      .entries
      .iter()
      .filter(|(_, e)| e.is_expired(now))
      .map(|(k, _)| k.clone())
      .collect();

    for key in &expired {
      state.remove(key);
    }
    self.counters.expired(expired.len() as u64);

    Ok(expired.len())
  }

  async fn stats(&self) -> Result<CacheStats> {
    let entries = self.lock()?.entries.len();
    Ok(self.counters.snapshot(entries))
  }
}
