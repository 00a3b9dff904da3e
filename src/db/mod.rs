pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{CacheError, Result};

/// Shared SQLite connection used by the durable stores.
///
/// Cloning is cheap; clones share one connection behind a mutex.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
  path: Option<PathBuf>,
}

impl Database {
  /// Open or create the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        CacheError::Storage(format!("Failed to create database directory: {}", e))
      })?;
    }

    let conn = Connection::open(&path).map_err(|e| {
      CacheError::Storage(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    debug!(path = %path.display(), "Opened cache database");
    Self::init(conn, Some(path))
  }

  /// Open a private in-memory database. Its contents die with the last clone.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    Self::init(conn, None)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CacheError::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("offline-cache").join("cache.db"))
  }

  fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
      path,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute_batch(schema::SCHEMA)
        .map_err(|e| CacheError::Storage(format!("Failed to run migrations: {}", e)))
    })
  }

  /// Run `f` with exclusive access to the connection.
  pub fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
    let mut conn = self.conn.lock().map_err(CacheError::lock_poisoned)?;
    f(&mut conn)
  }

  /// Location on disk, `None` for in-memory databases.
  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }
}
