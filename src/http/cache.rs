//! Cache keys and freshness rules for HTTP responses.

use sha2::{Digest, Sha256};
use std::time::Duration;

use super::types::HttpRequest;

/// Signature identifying a request for caching and de-duplication.
///
/// Format: `METHOD:url:headers-json:body-digest`. Headers are already
/// lowercased and sorted by `HttpRequest`, so equivalent requests collide.
/// The body is reduced to a SHA-256 digest; requests without a body end in
/// an empty segment.
pub fn request_key(request: &HttpRequest) -> String {
  let headers = serde_json::to_string(&request.headers).unwrap_or_default();
  let body = request
    .body
    .as_deref()
    .map(|b| hex::encode(Sha256::digest(b)))
    .unwrap_or_default();

  format!("{}:{}:{}:{}", request.method, request.url, headers, body)
}

/// `max-age` from a `Cache-Control` value, if present and numeric.
pub fn max_age(cache_control: &str) -> Option<Duration> {
  cache_control
    .split(',')
    .filter_map(|directive| directive.trim().strip_prefix("max-age="))
    .find_map(|secs| secs.trim().trim_matches('"').parse::<u64>().ok())
    .map(Duration::from_secs)
}

/// TTL for a response: its `max-age`, else `default`.
pub fn ttl_for(cache_control: Option<&str>, default: Duration) -> Duration {
  cache_control.and_then(max_age).unwrap_or(default)
}
