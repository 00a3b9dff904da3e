//! CLI subcommands and their handlers.

use clap::{Args, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use offline_cache::cache::{CacheManager, SqliteStore};
use offline_cache::clock::{self, SharedClock};
use offline_cache::config::{Config, StorageKind};
use offline_cache::db::Database;
use offline_cache::http::{Fetcher, HttpCache, HttpFetcher, HttpRequest, HttpResponse, Method};
use offline_cache::offline::{BucketStorage, OfflineCache};
use offline_cache::sync::SyncQueue;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Read a value from the key-value cache
  Get { key: String },
  /// Store a JSON value in the key-value cache
  Set {
    key: String,
    /// JSON value; bare words are stored as strings
    value: String,
    /// Time to live in milliseconds (default from config)
    #[arg(long)]
    ttl_ms: Option<u64>,
  },
  /// Remove a key
  Delete { key: String },
  /// List stored keys
  Keys,
  /// Remove every entry
  Clear,
  /// Show hit/miss statistics
  Stats,
  /// Fetch a URL through the HTTP response cache
  Fetch(RequestArgs),
  /// Prefetch the shell assets for the configured version
  Install,
  /// Delete buckets from other versions
  Activate,
  /// Answer a request the way the offline cache would
  Request {
    #[command(flatten)]
    request: RequestArgs,
    /// Serve stale content and refresh in the background
    #[arg(long)]
    swr: bool,
  },
  /// Inspect or edit the background sync queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Replay queued requests now
  Sync,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
  /// Queue a request for later replay
  Add(RequestArgs),
  /// List queued requests
  List,
  /// Remove a queued request by id
  Remove { id: String },
}

#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
  url: String,
  /// HTTP method
  #[arg(short = 'X', long, default_value = "GET")]
  method: String,
  /// Header as name:value (repeatable)
  #[arg(short = 'H', long = "header")]
  headers: Vec<String>,
  /// Request body
  #[arg(short = 'd', long)]
  data: Option<String>,
}

impl RequestArgs {
  fn to_request(&self) -> Result<HttpRequest> {
    let method: Method = self.method.parse()?;
    let mut request = HttpRequest::new(method, self.url.as_str());
    for header in &self.headers {
      let (name, value) = parse_header(header)?;
      request = request.with_header(&name, value);
    }
    if let Some(data) = &self.data {
      request = request.with_body(data.as_bytes());
    }
    Ok(request)
  }
}

/// Split a `name:value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Invalid header '{}', expected name:value", raw))?;
  let name = name.trim();
  if name.is_empty() {
    return Err(eyre!("Invalid header '{}', name is empty", raw));
  }
  Ok((name.to_string(), value.trim().to_string()))
}

/// Parse a CLI value as JSON, falling back to a plain string.
fn parse_value(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn print_response(response: &HttpResponse) {
  println!("HTTP {}", response.status);
  for (name, value) in &response.headers {
    println!("{}: {}", name, value);
  }
  println!();
  println!("{}", response.text());
}

/// Namespace for cached HTTP responses in the shared database.
const HTTP_NAMESPACE: &str = "http:";

struct Context {
  config: Config,
  clock: SharedClock,
}

impl Context {
  fn database(&self) -> Result<Database> {
    Ok(Database::open(self.config.database_path.as_deref())?)
  }

  /// Each CLI invocation is its own process, so the in-process backends
  /// fall back to the database file.
  fn cache(&self) -> Result<CacheManager<Value>> {
    let mut config = self.config.cache.clone();
    if config.storage != StorageKind::Local {
      debug!(configured = ?config.storage, "Using local storage for CLI cache commands");
      config.storage = StorageKind::Local;
    }
    Ok(CacheManager::open(
      &config,
      self.config.database_path.as_deref(),
      self.clock.clone(),
    )?)
  }

  /// Response cache persisted under its own namespace.
  fn http_cache(&self, fetcher: Arc<dyn Fetcher>) -> Result<HttpCache> {
    let store = SqliteStore::<HttpResponse>::new(
      self.database()?,
      HTTP_NAMESPACE,
      self.config.http.default_ttl(),
      self.clock.clone(),
    )
    .with_quota(self.config.cache.quota_bytes);
    let manager = CacheManager::with_store(Arc::new(store), StorageKind::Local);
    Ok(HttpCache::new(manager, fetcher, &self.config.http))
  }

  fn queue(&self, db: &Database) -> Result<SyncQueue> {
    let queue = SyncQueue::from_config(&self.config.sync, Some(db.clone()), self.clock.clone())?;
    Ok(queue.with_timeout(self.config.http.request_timeout()))
  }

  fn offline(&self) -> Result<OfflineCache> {
    let db = self.database()?;
    let fetcher = Arc::new(HttpFetcher::new(&self.config.http)?);
    let buckets = BucketStorage::new(db.clone(), self.clock.clone());
    let cache = OfflineCache::new(
      self.config.offline.clone(),
      buckets,
      fetcher,
      self.config.http.request_timeout(),
    )?;
    Ok(cache.with_sync_queue(self.queue(&db)?))
  }
}

pub async fn run(command: Command, config: Config) -> Result<()> {
  let ctx = Context {
    config,
    clock: clock::system(),
  };

  match command {
    Command::Get { key } => match ctx.cache()?.get(&key).await? {
      Some(value) => print_json(&value)?,
      None => return Err(eyre!("Key not found: {}", key)),
    },
    Command::Set { key, value, ttl_ms } => {
      ctx
        .cache()?
        .set(&key, parse_value(&value), ttl_ms.map(Duration::from_millis))
        .await?;
    }
    Command::Delete { key } => {
      let removed = ctx.cache()?.delete(&key).await?;
      println!("{}", if removed { "deleted" } else { "not found" });
    }
    Command::Keys => {
      for key in ctx.cache()?.keys().await? {
        println!("{}", key);
      }
    }
    Command::Clear => ctx.cache()?.clear().await?,
    Command::Stats => {
      let cache = ctx.cache()?;
      cache.purge_expired().await?;
      print_json(&cache.stats().await?)?;
    }
    Command::Fetch(args) => {
      let http = ctx.http_cache(Arc::new(HttpFetcher::new(&ctx.config.http)?))?;
      print_response(&http.fetch(&args.to_request()?).await?);
    }
    Command::Install => print_json(&ctx.offline()?.install().await?)?,
    Command::Activate => print_json(&ctx.offline()?.activate().await?)?,
    Command::Request { request, swr } => {
      let offline = ctx.offline()?;
      let request = request.to_request()?;
      let response = if swr {
        offline.stale_while_revalidate(&request).await?
      } else {
        offline.handle(&request).await?
      };
      print_response(&response);
    }
    Command::Queue(QueueCommand::Add(args)) => {
      let queue = ctx.queue(&ctx.database()?)?;
      println!("{}", queue.add_to_queue(args.to_request()?)?);
    }
    Command::Queue(QueueCommand::List) => {
      let queue = ctx.queue(&ctx.database()?)?;
      print_json(&queue.items()?)?;
    }
    Command::Queue(QueueCommand::Remove { id }) => {
      let queue = ctx.queue(&ctx.database()?)?;
      match queue.remove_from_queue(&id)? {
        Some(_) => println!("removed"),
        None => return Err(eyre!("No queued request with id {}", id)),
      }
    }
    Command::Sync => {
      let queue = ctx.queue(&ctx.database()?)?;
      let fetcher = HttpFetcher::new(&ctx.config.http)?;
      print_json(&queue.process_queue(&fetcher).await?)?;
    }
  }

  Ok(())
}
