//! Network access behind a trait, so every cache can run against a scripted fetcher.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::types::{HttpRequest, HttpResponse};
use crate::config::HttpConfig;
use crate::error::{CacheError, Result};

/// Performs one network round trip.
///
/// Implementations return `Ok` for every response the server produced,
/// including 4xx/5xx; `Err` means no response arrived.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// `Fetcher` backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: Client,
  timeout: Duration,
}

impl HttpFetcher {
  pub fn new(config: &HttpConfig) -> Result<Self> {
    let client = Client::builder()
      .user_agent(config.user_agent.clone())
      .timeout(config.request_timeout())
      .build()?;

    Ok(Self {
      client,
      timeout: config.request_timeout(),
    })
  }

  /// Timeouts keep their own variant whether they hit while sending or
  /// while reading the body.
  fn map_error(&self, err: reqwest::Error) -> CacheError {
    if err.is_timeout() {
      CacheError::Timeout(self.timeout)
    } else {
      CacheError::Network(err.to_string())
    }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| CacheError::InvalidRequest(e.to_string()))?;
    let url = reqwest::Url::parse(&request.url)?;

    let mut builder = self.client.request(method, url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| self.map_error(e))?;

    let status = response.status().as_u16();
    let mut out = HttpResponse::new(status);
    for (name, value) in response.headers() {
      if let Ok(value) = value.to_str() {
        out = out.with_header(name.as_str(), value);
      }
    }
    let body = response.bytes().await.map_err(|e| self.map_error(e))?;
    debug!(method = %request.method, url = %request.url, status, bytes = body.len(), "Fetched");

    Ok(out.with_body(body.to_vec()))
  }
}
