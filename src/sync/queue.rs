//! Durable queue of mutating requests that failed while offline.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::db::Database;
use crate::error::{CacheError, Result};
use crate::http::{Fetcher, HttpRequest};

/// A request waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
  pub id: String,
  #[serde(flatten)]
  pub request: HttpRequest,
  /// Epoch ms when the request was queued
  pub timestamp: i64,
  pub retry_count: u32,
}

/// Outcome notifications for queued requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  Replayed { id: String },
  RetryScheduled { id: String, retry_count: u32 },
  Dropped { id: String, retry_count: u32, reason: String },
}

/// Summary of one `process_queue` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
  pub replayed: usize,
  pub retried: usize,
  pub dropped: usize,
  /// Another pass was already running; nothing was attempted
  pub skipped: bool,
}

struct QueueInner {
  items: Mutex<Vec<SyncQueueItem>>,
  db: Option<Database>,
  max_retries: u32,
  clock: SharedClock,
  processing: AtomicBool,
  events: broadcast::Sender<SyncEvent>,
}

/// Clears the processing flag when a pass ends, including on early return.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// FIFO queue of failed mutations, replayed when connectivity returns.
///
/// With a database attached every change is written through, so items
/// survive restarts.
#[derive(Clone)]
pub struct SyncQueue {
  inner: Arc<QueueInner>,
  /// Upper bound on a single replay
  timeout: Duration,
}

const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

impl SyncQueue {
  pub fn in_memory(max_retries: u32, clock: SharedClock) -> Self {
    Self::build(Vec::new(), None, max_retries, clock)
  }

  /// Queue backed by the `sync_queue` table; existing rows are loaded.
  pub fn durable(db: Database, max_retries: u32, clock: SharedClock) -> Result<Self> {
    let items = db.with_conn(|conn| {
      let mut stmt = conn.prepare("SELECT item FROM sync_queue ORDER BY timestamp, rowid")?;
      let rows = stmt
        .query_map([], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })?;

    let mut loaded = Vec::with_capacity(items.len());
    for data in items {
      match serde_json::from_slice::<SyncQueueItem>(&data) {
        Ok(item) => loaded.push(item),
        Err(e) => warn!(error = %e, "Skipping unreadable sync queue row"),
      }
    }

    if !loaded.is_empty() {
      info!(count = loaded.len(), "Restored queued requests");
    }
    Ok(Self::build(loaded, Some(db), max_retries, clock))
  }

  /// Durable when configured and a database is available, otherwise in memory.
  pub fn from_config(config: &SyncConfig, db: Option<Database>, clock: SharedClock) -> Result<Self> {
    match db {
      Some(db) if config.durable => Self::durable(db, config.max_retries, clock),
      _ => Ok(Self::in_memory(config.max_retries, clock)),
    }
  }

  fn build(items: Vec<SyncQueueItem>, db: Option<Database>, max_retries: u32, clock: SharedClock) -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      inner: Arc::new(QueueInner {
        items: Mutex::new(items),
        db,
        max_retries,
        clock,
        processing: AtomicBool::new(false),
        events,
      }),
      timeout: DEFAULT_REPLAY_TIMEOUT,
    }
  }

  /// Give up on a replay after `timeout`; it then counts as a failed attempt.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  fn items_lock(&self) -> Result<MutexGuard<'_, Vec<SyncQueueItem>>> {
    self.inner.items.lock().map_err(CacheError::lock_poisoned)
  }

  fn persist(&self, item: &SyncQueueItem) -> Result<()> {
    let Some(db) = &self.inner.db else {
      return Ok(());
    };
    let data = serde_json::to_vec(item)?;
    db.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO sync_queue (id, item, timestamp, retry_count)
         VALUES (?, ?, ?, ?)",
        params![item.id, data, item.timestamp, item.retry_count],
      )?;
      Ok(())
    })
  }

  fn unpersist(&self, id: &str) -> Result<()> {
    let Some(db) = &self.inner.db else {
      return Ok(());
    };
    db.with_conn(|conn| {
      conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id])?;
      Ok(())
    })
  }

  fn emit(&self, event: SyncEvent) {
    // No subscribers is fine
    let _ = self.inner.events.send(event);
  }

  /// Queue `request` for replay. Returns the new item's id.
  pub fn add_to_queue(&self, request: HttpRequest) -> Result<String> {
    let item = SyncQueueItem {
      id: Uuid::new_v4().to_string(),
      request,
      timestamp: self.inner.clock.now_ms(),
      retry_count: 0,
    };

    self.persist(&item)?;
    let id = item.id.clone();
    info!(id = %id, method = %item.request.method, url = %item.request.url, "Queued request for background sync");
    self.items_lock()?.push(item);
    Ok(id)
  }

  pub fn remove_from_queue(&self, id: &str) -> Result<Option<SyncQueueItem>> {
    let removed = {
      let mut items = self.items_lock()?;
      items
        .iter()
        .position(|item| item.id == id)
        .map(|pos| items.remove(pos))
    };
    if removed.is_some() {
      self.unpersist(id)?;
    }
    Ok(removed)
  }

  /// Snapshot of queued items, oldest first.
  pub fn items(&self) -> Result<Vec<SyncQueueItem>> {
    Ok(self.items_lock()?.clone())
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.items_lock()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn max_retries(&self) -> u32 {
    self.inner.max_retries
  }

  fn contains(&self, id: &str) -> Result<bool> {
    Ok(self.items_lock()?.iter().any(|item| item.id == id))
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  fn record_retry(&self, id: &str, retry_count: u32) -> Result<()> {
    let updated = {
      let mut items = self.items_lock()?;
      items.iter_mut().find(|item| item.id == id).map(|item| {
        item.retry_count = retry_count;
        item.clone()
      })
    };
    match updated {
      Some(item) => self.persist(&item),
      // Removed by someone else mid-pass
      None => Ok(()),
    }
  }

  /// Replay every queued request once.
  ///
  /// A 2xx response removes the item. Any other outcome bumps its retry
  /// count; at `max_retries` the item is dropped with a warning and a
  /// `SyncEvent::Dropped`. Only one pass runs at a time.
  pub async fn process_queue(&self, fetcher: &dyn Fetcher) -> Result<ProcessReport> {
    if self
      .inner
      .processing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("Sync pass already running, skipping");
      return Ok(ProcessReport {
        skipped: true,
        ..ProcessReport::default()
      });
    }
    let _guard = PassGuard(&self.inner.processing);

    let snapshot = self.items()?;
    let mut report = ProcessReport::default();

    for item in snapshot {
      if !self.contains(&item.id)? {
        debug!(id = %item.id, "Queued request removed mid-pass, not replaying");
        continue;
      }

      let failure = match tokio::time::timeout(self.timeout, fetcher.fetch(&item.request)).await {
        Ok(Ok(response)) if response.is_success() => None,
        Ok(Ok(response)) => Some(format!("HTTP {}", response.status)),
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(CacheError::Timeout(self.timeout).to_string()),
      };

      let Some(reason) = failure else {
        self.remove_from_queue(&item.id)?;
        report.replayed += 1;
        debug!(id = %item.id, url = %item.request.url, "Replayed queued request");
        self.emit(SyncEvent::Replayed { id: item.id });
        continue;
      };

      let retry_count = item.retry_count + 1;
      if retry_count >= self.inner.max_retries {
        self.remove_from_queue(&item.id)?;
        report.dropped += 1;
        warn!(
          id = %item.id,
          method = %item.request.method,
          url = %item.request.url,
          retry_count,
          reason = %reason,
          "Dropping queued request after exhausting retries"
        );
        self.emit(SyncEvent::Dropped {
          id: item.id,
          retry_count,
          reason,
        });
      } else {
        self.record_retry(&item.id, retry_count)?;
        report.retried += 1;
        debug!(id = %item.id, retry_count, reason = %reason, "Replay failed, will retry");
        self.emit(SyncEvent::RetryScheduled {
          id: item.id,
          retry_count,
        });
      }
    }

    if report.replayed + report.dropped + report.retried > 0 {
      info!(
        replayed = report.replayed,
        retried = report.retried,
        dropped = report.dropped,
        "Sync pass finished"
      );
    }
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::{self, ManualClock};
  use crate::http::client::mock::MockFetcher;
  use crate::http::{HttpResponse, Method};
  use async_trait::async_trait;
  use tempfile::tempdir;

  fn post(url: &str) -> HttpRequest {
    HttpRequest::new(Method::Post, url)
      .with_header("Content-Type", "application/json")
      .with_body(r#"{"title":"draft"}"#)
  }

  #[test]
  fn test_item_wire_shape() {
    let item = SyncQueueItem {
      id: "abc".to_string(),
      request: post("http://x/api/posts"),
      timestamp: 42,
      retry_count: 1,
    };
    let json = serde_json::to_value(&item).unwrap();

    assert_eq!(json["id"], "abc");
    assert_eq!(json["url"], "http://x/api/posts");
    assert_eq!(json["method"], "POST");
    assert_eq!(json["headers"]["content-type"], "application/json");
    assert_eq!(json["timestamp"], 42);
    assert_eq!(json["retryCount"], 1);

    let back: SyncQueueItem = serde_json::from_value(json).unwrap();
    assert_eq!(back, item);
  }

  #[test]
  fn test_add_and_remove() {
    let clock = Arc::new(ManualClock::new(1_000));
    let queue = SyncQueue::in_memory(3, clock);

    let id = queue.add_to_queue(post("http://x/a")).unwrap();
    let items = queue.items().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].timestamp, 1_000);
    assert_eq!(items[0].retry_count, 0);
    assert!(Uuid::parse_str(&id).is_ok());

    assert!(queue.remove_from_queue(&id).unwrap().is_some());
    assert!(queue.remove_from_queue(&id).unwrap().is_none());
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_successful_replay_removes_item() {
    let mock = MockFetcher::new();
    mock.respond("http://x/a", HttpResponse::new(201));
    let queue = SyncQueue::in_memory(3, clock::system());
    let mut events = queue.subscribe();

    let id = queue.add_to_queue(post("http://x/a")).unwrap();
    let report = queue.process_queue(&mock).await.unwrap();

    assert_eq!(report.replayed, 1);
    assert!(queue.is_empty().unwrap());
    assert_eq!(events.recv().await.unwrap(), SyncEvent::Replayed { id });
  }

  #[tokio::test]
  async fn test_retry_ceiling_drops_after_three_failures() {
    let mock = MockFetcher::new();
    mock.fail("http://x/a");
    let queue = SyncQueue::in_memory(3, clock::system());
    let mut events = queue.subscribe();
    let id = queue.add_to_queue(post("http://x/a")).unwrap();

    let first = queue.process_queue(&mock).await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(queue.items().unwrap()[0].retry_count, 1);

    queue.process_queue(&mock).await.unwrap();
    assert_eq!(queue.items().unwrap()[0].retry_count, 2);

    let third = queue.process_queue(&mock).await.unwrap();
    assert_eq!(third.dropped, 1);
    assert!(queue.is_empty().unwrap());
    assert_eq!(mock.calls(), 3);

    assert!(matches!(events.recv().await.unwrap(), SyncEvent::RetryScheduled { retry_count: 1, .. }));
    assert!(matches!(events.recv().await.unwrap(), SyncEvent::RetryScheduled { retry_count: 2, .. }));
    match events.recv().await.unwrap() {
      SyncEvent::Dropped {
        id: dropped,
        retry_count,
        ..
      } => {
        assert_eq!(dropped, id);
        assert_eq!(retry_count, 3);
      }
      other => panic!("unexpected event {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_server_errors_count_as_failures() {
    let mock = MockFetcher::new();
    mock.respond("http://x/a", HttpResponse::new(500));
    let queue = SyncQueue::in_memory(3, clock::system());
    queue.add_to_queue(post("http://x/a")).unwrap();

    let report = queue.process_queue(&mock).await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_items_replay_in_queue_order() {
    let mock = MockFetcher::new();
    mock.respond("http://x/1", HttpResponse::new(200));
    mock.fail("http://x/2");
    mock.respond("http://x/3", HttpResponse::new(204));
    let queue = SyncQueue::in_memory(3, clock::system());
    for url in ["http://x/1", "http://x/2", "http://x/3"] {
      queue.add_to_queue(post(url)).unwrap();
    }

    let report = queue.process_queue(&mock).await.unwrap();
    assert_eq!(report.replayed, 2);
    assert_eq!(report.retried, 1);

    let left = queue.items().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].request.url, "http://x/2");
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_pass_is_skipped() {
    let mock = MockFetcher::new().with_delay(Duration::from_millis(100));
    mock.respond("http://x/a", HttpResponse::new(200));
    let queue = SyncQueue::in_memory(3, clock::system());
    queue.add_to_queue(post("http://x/a")).unwrap();

    let (first, second) = tokio::join!(queue.process_queue(&mock), queue.process_queue(&mock));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.replayed, 1);
    assert!(second.skipped);
    assert_eq!(mock.calls(), 1);

    // Guard is released afterwards
    let third = queue.process_queue(&mock).await.unwrap();
    assert!(!third.skipped);
  }

  #[tokio::test]
  async fn test_durable_queue_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let mock = MockFetcher::new();
    mock.fail("http://x/a");
    mock.respond("http://x/b", HttpResponse::new(200));

    let id = {
      let queue = SyncQueue::durable(Database::open(Some(&path)).unwrap(), 3, clock::system()).unwrap();
      let id = queue.add_to_queue(post("http://x/a")).unwrap();
      queue.add_to_queue(post("http://x/b")).unwrap();
      queue.process_queue(&mock).await.unwrap();
      id
    };

    let queue = SyncQueue::durable(Database::open(Some(&path)).unwrap(), 3, clock::system()).unwrap();
    let items = queue.items().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, id);
    assert_eq!(items[0].retry_count, 1);
    assert_eq!(items[0].request.body.as_deref(), Some(&br#"{"title":"draft"}"#[..]));
  }

  #[test]
  fn test_from_config_without_database_is_in_memory() {
    let queue = SyncQueue::from_config(&SyncConfig::default(), None, clock::system()).unwrap();
    assert_eq!(queue.max_retries(), 3);
    assert!(queue.is_empty().unwrap());
  }

  /// Cancels one queued request the first time it is asked to send anything.
  struct CancellingFetcher {
    queue: SyncQueue,
    cancel: Mutex<Option<String>>,
    sent: Mutex<Vec<String>>,
  }

  #[async_trait]
  impl Fetcher for CancellingFetcher {
    async fn fetch(&self, request: &HttpRequest) -> crate::error::Result<HttpResponse> {
      self.sent.lock().unwrap().push(request.url.clone());
      if let Some(id) = self.cancel.lock().unwrap().take() {
        self.queue.remove_from_queue(&id).unwrap();
      }
      Ok(HttpResponse::new(200))
    }
  }

  #[tokio::test]
  async fn test_item_removed_mid_pass_is_not_replayed() {
    let queue = SyncQueue::in_memory(3, clock::system());
    queue.add_to_queue(post("http://x/1")).unwrap();
    let cancelled = queue.add_to_queue(post("http://x/2")).unwrap();

    let fetcher = CancellingFetcher {
      queue: queue.clone(),
      cancel: Mutex::new(Some(cancelled)),
      sent: Mutex::new(Vec::new()),
    };
    let report = queue.process_queue(&fetcher).await.unwrap();

    assert_eq!(*fetcher.sent.lock().unwrap(), vec!["http://x/1".to_string()]);
    assert_eq!(report.replayed, 1);
    assert_eq!(report.retried + report.dropped, 0);
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_replay_times_out_and_releases_pass() {
    let mock = MockFetcher::new().with_delay(Duration::from_secs(3600));
    mock.respond("http://x/a", HttpResponse::new(200));
    let queue = SyncQueue::in_memory(3, clock::system()).with_timeout(Duration::from_secs(1));
    let mut events = queue.subscribe();
    queue.add_to_queue(post("http://x/a")).unwrap();

    let report = queue.process_queue(&mock).await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(queue.items().unwrap()[0].retry_count, 1);
    assert!(matches!(
      events.recv().await.unwrap(),
      SyncEvent::RetryScheduled { retry_count: 1, .. }
    ));

    // The flag was released, so the next pass runs
    let next = queue.process_queue(&mock).await.unwrap();
    assert!(!next.skipped);
  }
}
