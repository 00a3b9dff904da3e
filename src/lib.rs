//! Multi-layer caching for offline-capable clients.
//!
//! - [`cache`]: TTL key-value stores (in-memory LRU, SQLite) behind a façade
//! - [`http`]: response cache with request de-duplication
//! - [`offline`]: versioned offline buckets and fetch strategies
//! - [`sync`]: queue of mutations replayed when connectivity returns

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod offline;
pub mod sync;

pub use error::{CacheError, Result};
