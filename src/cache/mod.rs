//! Generic TTL caching layer.
//!
//! This module provides the key-value cache core:
//! - A `CacheStore` trait with one implementation per backend
//! - A bounded in-memory store with LRU eviction and proactive expiry timers
//! - A SQLite store for persistent and per-session caches
//! - A `CacheManager` façade that selects the backend from configuration

mod manager;
mod memory;
mod storage;
mod traits;

pub use manager::CacheManager;
pub use memory::MemoryStore;
pub use storage::SqliteStore;
pub use traits::{CacheEntry, CacheStats, CacheStore, Cacheable};
