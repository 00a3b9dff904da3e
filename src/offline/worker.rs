//! Offline-first request handling over versioned buckets.

use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::buckets::BucketStorage;
use crate::config::OfflineConfig;
use crate::error::{CacheError, Result};
use crate::http::{Fetcher, HttpRequest, HttpResponse, Method};
use crate::sync::SyncQueue;

const OFFLINE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Offline</title></head>
<body>
<h1>You are offline</h1>
<p>This page is not available offline. Check your connection and try again.</p>
</body>
</html>
"#;

const IMAGE_PLACEHOLDER: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200"><rect width="200" height="200" fill="#e0e0e0"/><text x="100" y="105" font-family="sans-serif" font-size="14" fill="#757575" text-anchor="middle">Image unavailable</text></svg>"##;

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico"];

/// Lifecycle of an offline cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
  Parsed,
  Installed,
  Active,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
  pub bucket: String,
  pub cached: Vec<String>,
  /// URL and reason for every asset that could not be prefetched
  pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
  pub deleted: Vec<String>,
  pub kept: Vec<String>,
}

fn offline_json() -> HttpResponse {
  HttpResponse::json(
    503,
    &json!({
      "error": "Offline",
      "message": "Network unavailable",
      "cached": false,
    }),
  )
}

fn offline_html() -> HttpResponse {
  HttpResponse::new(503)
    .with_header("content-type", "text/html; charset=utf-8")
    .with_body(OFFLINE_HTML)
}

fn image_placeholder() -> HttpResponse {
  HttpResponse::new(200)
    .with_header("content-type", "image/svg+xml")
    .with_body(IMAGE_PLACEHOLDER)
}

/// Offline content cache for one app version.
///
/// Shell assets are prefetched into `shell-<version>` at install; responses
/// seen at runtime go into `data-<version>`. Activation garbage-collects every
/// other generation.
#[derive(Clone)]
pub struct OfflineCache {
  config: Arc<OfflineConfig>,
  origin: Url,
  buckets: BucketStorage,
  fetcher: Arc<dyn Fetcher>,
  queue: Option<SyncQueue>,
  state: Arc<Mutex<WorkerState>>,
  timeout: Duration,
}

impl OfflineCache {
  pub fn new(
    config: OfflineConfig,
    buckets: BucketStorage,
    fetcher: Arc<dyn Fetcher>,
    timeout: Duration,
  ) -> Result<Self> {
    let origin = Url::parse(&config.origin)?;
    Ok(Self {
      config: Arc::new(config),
      origin,
      buckets,
      fetcher,
      queue: None,
      state: Arc::new(Mutex::new(WorkerState::Parsed)),
      timeout,
    })
  }

  /// Queue failed mutations for background sync instead of answering 503.
  pub fn with_sync_queue(mut self, queue: SyncQueue) -> Self {
    self.queue = Some(queue);
    self
  }

  pub fn state(&self) -> Result<WorkerState> {
    Ok(*self.state.lock().map_err(CacheError::lock_poisoned)?)
  }

  fn set_state(&self, state: WorkerState) -> Result<()> {
    *self.state.lock().map_err(CacheError::lock_poisoned)? = state;
    Ok(())
  }

  pub fn buckets(&self) -> &BucketStorage {
    &self.buckets
  }

  fn resolve(&self, url: &str) -> Result<Url> {
    Ok(self.origin.join(url)?)
  }

  async fn network(&self, request: &HttpRequest) -> Result<HttpResponse> {
    tokio::time::timeout(self.timeout, self.fetcher.fetch(request))
      .await
      .map_err(|_| CacheError::Timeout(self.timeout))?
  }

  fn store_runtime(&self, url: &str, response: &HttpResponse) {
    let bucket = self.config.data_bucket();
    if let Err(e) = self.buckets.put(&bucket, url, response) {
      warn!(url, error = %e, "Failed to cache response");
    }
  }

  /// Prefetch every shell asset into this version's shell bucket.
  ///
  /// Individual failures are reported, never fatal.
  pub async fn install(&self) -> Result<InstallReport> {
    let bucket = self.config.shell_bucket();
    self.buckets.open(&bucket)?;

    let mut report = InstallReport {
      bucket: bucket.clone(),
      ..InstallReport::default()
    };

    for asset in &self.config.shell_assets {
      let url = match self.resolve(asset) {
        Ok(url) => url.to_string(),
        Err(e) => {
          report.failed.push((asset.clone(), e.to_string()));
          continue;
        }
      };

      let outcome = match self.network(&HttpRequest::get(url.as_str())).await {
        Ok(response) if response.is_success() => self.buckets.put(&bucket, &url, &response).map(|_| ()),
        Ok(response) => Err(CacheError::Network(format!("HTTP {}", response.status))),
        Err(e) => Err(e),
      };

      match outcome {
        Ok(()) => report.cached.push(url),
        Err(e) => {
          warn!(url = %url, error = %e, "Failed to prefetch shell asset");
          report.failed.push((url, e.to_string()));
        }
      }
    }

    self.set_state(WorkerState::Installed)?;
    info!(
      bucket = %report.bucket,
      cached = report.cached.len(),
      failed = report.failed.len(),
      "Installed offline cache"
    );
    Ok(report)
  }

  /// Delete every bucket from other versions and take over request handling.
  pub async fn activate(&self) -> Result<ActivateReport> {
    let current = [self.config.shell_bucket(), self.config.data_bucket()];
    let mut report = ActivateReport::default();

    for name in self.buckets.names()? {
      if current.contains(&name) {
        continue;
      }
      if self.buckets.delete(&name)? {
        info!(bucket = %name, "Deleted stale cache bucket");
        report.deleted.push(name);
      }
    }

    self.buckets.open(&self.config.data_bucket())?;
    report.kept = self.buckets.names()?;

    self.set_state(WorkerState::Active)?;
    info!(version = %self.config.version, "Offline cache active");
    Ok(report)
  }

  fn is_api(&self, url: &Url) -> bool {
    self
      .config
      .api_prefixes
      .iter()
      .any(|prefix| url.path().starts_with(prefix.as_str()))
  }

  fn is_image(request: &HttpRequest, url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    request.accepts("image/") || IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
  }

  /// Answer `request` using the strategy for its kind.
  ///
  /// - non-GET: network, queued for background sync when offline
  /// - API paths: network-first, cached copy or JSON 503 when offline
  /// - HTML navigations: network-first, then cached page, then offline page
  /// - everything else: cache-first, image placeholder when unavailable
  pub async fn handle(&self, request: &HttpRequest) -> Result<HttpResponse> {
    let url = self.resolve(&request.url)?;
    let mut request = request.clone();
    request.url = url.to_string();

    if request.method != Method::Get {
      return self.handle_mutation(request).await;
    }
    if self.is_api(&url) {
      return self.network_first_api(&request).await;
    }
    if request.accepts("text/html") {
      return self.network_first_page(&request).await;
    }
    self.cache_first(&request, &url).await
  }

  async fn handle_mutation(&self, request: HttpRequest) -> Result<HttpResponse> {
    match self.network(&request).await {
      Ok(response) => Ok(response),
      Err(e) if e.is_network() => match &self.queue {
        Some(queue) => {
          let id = queue.add_to_queue(request)?;
          Ok(HttpResponse::json(202, &json!({ "queued": true, "id": id })))
        }
        None => {
          debug!(url = %request.url, error = %e, "Mutation failed offline");
          Ok(offline_json())
        }
      },
      Err(e) => Err(e),
    }
  }

  async fn network_first_api(&self, request: &HttpRequest) -> Result<HttpResponse> {
    match self.network(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_runtime(&request.url, &response);
        }
        Ok(response)
      }
      Err(e) if e.is_network() => {
        if let Some(cached) = self.buckets.match_any(&request.url)? {
          debug!(url = %request.url, "Network unavailable, serving cached API response");
          return Ok(cached);
        }
        debug!(url = %request.url, error = %e, "Network unavailable and nothing cached");
        Ok(offline_json())
      }
      Err(e) => Err(e),
    }
  }

  async fn network_first_page(&self, request: &HttpRequest) -> Result<HttpResponse> {
    match self.network(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_runtime(&request.url, &response);
        }
        Ok(response)
      }
      Err(e) if e.is_network() => {
        if let Some(cached) = self.buckets.match_any(&request.url)? {
          return Ok(cached);
        }
        let offline_url = self.resolve(&self.config.offline_page)?;
        if let Some(page) = self.buckets.match_any(offline_url.as_str())? {
          return Ok(page);
        }
        debug!(url = %request.url, error = %e, "Serving built-in offline page");
        Ok(offline_html())
      }
      Err(e) => Err(e),
    }
  }

  async fn cache_first(&self, request: &HttpRequest, url: &Url) -> Result<HttpResponse> {
    if let Some(cached) = self.buckets.match_any(&request.url)? {
      return Ok(cached);
    }

    match self.network(request).await {
      Ok(response) => {
        if response.status == 200 {
          self.store_runtime(&request.url, &response);
        }
        Ok(response)
      }
      Err(e) if Self::is_image(request, url) => {
        debug!(url = %request.url, error = %e, "Serving image placeholder");
        Ok(image_placeholder())
      }
      Err(e) => Err(e),
    }
  }

  /// Serve a cached copy immediately and refresh it in the background.
  ///
  /// Without a cached copy this waits for the network.
  pub async fn stale_while_revalidate(&self, request: &HttpRequest) -> Result<HttpResponse> {
    let url = self.resolve(&request.url)?;
    let mut request = request.clone();
    request.url = url.to_string();

    if let Some(cached) = self.buckets.match_any(&request.url)? {
      let this = self.clone();
      tokio::spawn(async move {
        match this.network(&request).await {
          Ok(response) if response.is_success() => {
            this.store_runtime(&request.url, &response);
            debug!(url = %request.url, "Revalidated cached response");
          }
          Ok(response) => debug!(url = %request.url, status = response.status, "Revalidation skipped"),
          Err(e) => debug!(url = %request.url, error = %e, "Revalidation failed"),
        }
      });
      return Ok(cached);
    }

    let response = self.network(&request).await?;
    if response.is_success() {
      self.store_runtime(&request.url, &response);
    }
    Ok(response)
  }
}
