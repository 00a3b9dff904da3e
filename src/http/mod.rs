//! HTTP response caching.

mod cache;
mod cached_client;
pub(crate) mod client;
mod types;

pub use cache::{max_age, request_key, ttl_for};
pub use cached_client::HttpCache;
pub use client::{Fetcher, HttpFetcher};
pub use types::{HttpRequest, HttpResponse, Method};
