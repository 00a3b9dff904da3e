//! Error types shared by every cache component.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by stores, the HTTP cache, the offline cache and the sync queue.
///
/// A cache miss is never an error: lookups return `Ok(None)` for absent keys.
/// The enum is `Clone` so a single in-flight network result can be handed to
/// every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// The backing store rejected a read or write.
  #[error("Storage error: {0}")]
  Storage(String),

  /// The backing store is full, even after expired entries were swept.
  #[error("Storage quota exceeded: {0}")]
  QuotaExceeded(String),

  #[error("Serialization error: {0}")]
  Serialization(String),

  /// The network call failed or the host is offline.
  #[error("Network error: {0}")]
  Network(String),

  #[error("Request timed out after {0:?}")]
  Timeout(Duration),

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

impl CacheError {
  pub fn is_quota_exceeded(&self) -> bool {
    matches!(self, CacheError::QuotaExceeded(_))
  }

  /// True for failures where a cached fallback is worth trying.
  pub fn is_network(&self) -> bool {
    matches!(self, CacheError::Network(_) | CacheError::Timeout(_))
  }

  pub(crate) fn lock_poisoned(err: impl std::fmt::Display) -> Self {
    CacheError::Storage(format!("Lock poisoned: {}", err))
  }
}

impl From<rusqlite::Error> for CacheError {
  fn from(err: rusqlite::Error) -> Self {
    match &err {
      rusqlite::Error::SqliteFailure(code, _) if code.code == rusqlite::ErrorCode::DiskFull => {
        CacheError::QuotaExceeded(err.to_string())
      }
      _ => CacheError::Storage(err.to_string()),
    }
  }
}

impl From<serde_json::Error> for CacheError {
  fn from(err: serde_json::Error) -> Self {
    CacheError::Serialization(err.to_string())
  }
}

impl From<reqwest::Error> for CacheError {
  fn from(err: reqwest::Error) -> Self {
    CacheError::Network(err.to_string())
  }
}

impl From<url::ParseError> for CacheError {
  fn from(err: url::ParseError) -> Self {
    CacheError::InvalidRequest(err.to_string())
  }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_storage_error_display() {
    let err = CacheError::Storage("disk unavailable".to_string());
    assert_eq!(format!("{}", err), "Storage error: disk unavailable");
  }

  #[test]
  fn test_timeout_display() {
    let err = CacheError::Timeout(Duration::from_secs(30));
    assert_eq!(format!("{}", err), "Request timed out after 30s");
  }

  #[test]
  fn test_disk_full_maps_to_quota_exceeded() {
    let sqlite_err = rusqlite::Error::SqliteFailure(
      rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
      Some("database or disk is full".to_string()),
    );
    let err: CacheError = sqlite_err.into();
    assert!(err.is_quota_exceeded());
  }

  #[test]
  fn test_other_sqlite_errors_map_to_storage() {
    let err: CacheError = rusqlite::Error::QueryReturnedNoRows.into();
    assert!(matches!(err, CacheError::Storage(_)));
    assert!(!err.is_network());
  }

  #[test]
  fn test_network_classification() {
    assert!(CacheError::Network("offline".to_string()).is_network());
    assert!(CacheError::Timeout(Duration::from_millis(5)).is_network());
    assert!(!CacheError::QuotaExceeded("full".to_string()).is_network());
  }
}
