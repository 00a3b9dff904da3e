//! Named, versioned response buckets persisted in SQLite.

use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::db::Database;
use crate::error::Result;
use crate::http::HttpResponse;

/// Named collections of cached responses keyed by absolute URL.
#[derive(Clone)]
pub struct BucketStorage {
  db: Database,
  clock: SharedClock,
}

impl BucketStorage {
  pub fn new(db: Database, clock: SharedClock) -> Self {
    Self { db, clock }
  }

  /// Create `name` if it does not exist yet.
  pub fn open(&self, name: &str) -> Result<()> {
    let now = self.clock.now_ms();
    self.db.with_conn(|conn| {
      conn.execute(
        "INSERT OR IGNORE INTO offline_buckets (name, created_at) VALUES (?, ?)",
        params![name, now],
      )?;
      Ok(())
    })
  }

  pub fn exists(&self, name: &str) -> Result<bool> {
    self.db.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT 1 FROM offline_buckets WHERE name = ?",
            params![name],
            |_| Ok(()),
          )
          .optional()?
          .is_some(),
      )
    })
  }

  /// Bucket names, oldest first.
  pub fn names(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn.prepare("SELECT name FROM offline_buckets ORDER BY created_at, rowid")?;
      let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      Ok(names)
    })
  }

  /// Delete a bucket and everything in it.
  pub fn delete(&self, name: &str) -> Result<bool> {
    let removed = self.db.with_conn(|conn| {
      Ok(conn.execute("DELETE FROM offline_buckets WHERE name = ?", params![name])?)
    })?;
    Ok(removed > 0)
  }

  /// Store `response` under `url`, but only if `bucket` still exists.
  ///
  /// Returns `false` when the bucket is gone, so a response that arrives
  /// after its generation was deleted is dropped rather than recreating it.
  pub fn put(&self, bucket: &str, url: &str, response: &HttpResponse) -> Result<bool> {
    let data = serde_json::to_vec(response)?;
    let now = self.clock.now_ms();

    let inserted = self.db.with_conn(|conn| {
      Ok(conn.execute(
        "INSERT OR REPLACE INTO offline_entries (bucket, url, response, stored_at)
         SELECT ?1, ?2, ?3, ?4
         WHERE EXISTS (SELECT 1 FROM offline_buckets WHERE name = ?1)",
        params![bucket, url, data, now],
      )?)
    })?;

    if inserted == 0 {
      debug!(bucket, url, "Bucket no longer exists, dropping response");
    }
    Ok(inserted > 0)
  }

  pub fn get(&self, bucket: &str, url: &str) -> Result<Option<HttpResponse>> {
    let data: Option<Vec<u8>> = self.db.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT response FROM offline_entries WHERE bucket = ? AND url = ?",
            params![bucket, url],
            |row| row.get(0),
          )
          .optional()?,
      )
    })?;

    Ok(data.and_then(|d| decode(url, &d)))
  }

  /// First match for `url` across all buckets, oldest bucket first.
  pub fn match_any(&self, url: &str) -> Result<Option<HttpResponse>> {
    let data: Option<Vec<u8>> = self.db.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT e.response FROM offline_entries e
             JOIN offline_buckets b ON b.name = e.bucket
             WHERE e.url = ?
             ORDER BY b.created_at, b.rowid
             LIMIT 1",
            params![url],
            |row| row.get(0),
          )
          .optional()?,
      )
    })?;

    Ok(data.and_then(|d| decode(url, &d)))
  }

  pub fn urls(&self, bucket: &str) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt =
        conn.prepare("SELECT url FROM offline_entries WHERE bucket = ? ORDER BY stored_at, url")?;
      let urls = stmt
        .query_map(params![bucket], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      Ok(urls)
    })
  }
}

fn decode(url: &str, data: &[u8]) -> Option<HttpResponse> {
  match serde_json::from_slice(data) {
    Ok(response) => Some(response),
    Err(e) => {
      warn!(url, error = %e, "Ignoring unreadable cached response");
      None
    }
  }
}
